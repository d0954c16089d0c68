use std::sync::Arc;

use num_bigint::BigUint;
use pretty_assertions::assert_eq;

use super::*;

fn big(n: u32) -> BigUint {
    BigUint::from(n)
}

/// `tuple { i32, variant [ tuple {}, i32 ] }`
fn optional_field_schema() -> Arc<Schema> {
    Schema::new(TypeNode::Tuple(vec![
        TypeNode::Prim(PrimKind::I32),
        TypeNode::Variant(vec![TypeNode::empty_tuple(), TypeNode::Prim(PrimKind::I32)]),
    ]))
    .unwrap()
}

#[test]
fn flat_tuple_numbers_fields_in_order() {
    let schema = Schema::new(TypeNode::Tuple(vec![
        TypeNode::Prim(PrimKind::I64),
        TypeNode::Prim(PrimKind::Str),
        TypeNode::Prim(PrimKind::Bool),
    ]))
    .unwrap();

    assert_eq!(schema.field_count(), 3);
    assert_eq!(schema.variant_count(), 0);
    assert_eq!(schema.accessor_limit(), 3);
    assert_eq!(schema.fields()[0].ty.fixed_len(), Some(8));
    assert_eq!(schema.fields()[1].ty.fixed_len(), None);
    assert_eq!(schema.fields()[2].ty.fixed_len(), Some(1));
    assert_eq!(*schema.multi_choice_count(), big(1));
}

#[test]
fn optional_field_has_two_shapes() {
    let schema = optional_field_schema();

    assert_eq!(schema.field_count(), 2);
    assert_eq!(schema.variant_count(), 1);
    assert_eq!(*schema.multi_choice_count(), big(2));
    let variant = &schema.variants()[0];
    assert_eq!(variant.cases, 2);
    assert_eq!(variant.case_counts, vec![big(1), big(1)]);
    assert_eq!(variant.total, big(2));
    // Field 0 is unconditional; field 1 exists only under case 1.
    assert_eq!(schema.fields()[0].dominator, None);
    assert_eq!(schema.fields()[1].dominator, Some((0, 1)));
}

#[test]
fn nested_variant_counts_multiply_and_sum() {
    // variant [ tuple { variant[2 cases], variant[3 cases] }, i32 ]
    let two = TypeNode::Variant(vec![TypeNode::Prim(PrimKind::I8), TypeNode::empty_tuple()]);
    let three = TypeNode::Variant(vec![
        TypeNode::Prim(PrimKind::I8),
        TypeNode::Prim(PrimKind::I16),
        TypeNode::empty_tuple(),
    ]);
    let schema = Schema::new(TypeNode::Variant(vec![
        TypeNode::Tuple(vec![two, three]),
        TypeNode::Prim(PrimKind::I32),
    ]))
    .unwrap();

    // 2 * 3 for the tuple case, plus 1 for the i32 case.
    assert_eq!(*schema.multi_choice_count(), big(7));
    assert_eq!(schema.variants()[0].case_counts, vec![big(6), big(1)]);
    // Inner variants are dominated by case 0 of the outer one.
    assert_eq!(schema.variants()[1].dominator, Some((0, 0)));
    assert_eq!(schema.variants()[2].dominator, Some((0, 0)));
}

#[test]
fn list_of_tuple_becomes_part_element() {
    let schema = Schema::new(TypeNode::List(Box::new(TypeNode::Tuple(vec![
        TypeNode::Prim(PrimKind::I32),
        TypeNode::Prim(PrimKind::Str),
    ]))))
    .unwrap();

    assert_eq!(schema.field_count(), 1);
    assert_eq!(schema.boxed().len(), 0);
    // Choices below a list do not count at this level.
    assert_eq!(*schema.multi_choice_count(), big(1));
    match &schema.fields()[0].ty {
        FieldTy::List(ElemDecl::Part(sub)) => {
            assert_eq!(sub.field_count(), 2);
        }
        other => panic!("expected structured list element, got {other:?}"),
    }
}

#[test]
fn list_of_variant_exports_boxed_accessors() {
    // list [ variant [ i32, str ] ]: the sub-schema has two fields and one
    // variant, so three boxed accessors fan out through the box list.
    let schema = Schema::new(TypeNode::List(Box::new(TypeNode::Variant(vec![
        TypeNode::Prim(PrimKind::I32),
        TypeNode::Prim(PrimKind::Str),
    ]))))
    .unwrap();

    assert_eq!(schema.field_count(), 1);
    assert_eq!(schema.variant_count(), 0);
    assert_eq!(schema.boxed().len(), 3);
    assert_eq!(schema.first_boxed(), 1);
    assert_eq!(schema.accessor_limit(), 4);
    assert_eq!(schema.boxed()[0], BoxedDecl { box_field: 0, inner: 0 });
    assert_eq!(schema.boxed()[2], BoxedDecl { box_field: 0, inner: 2 });
}

#[test]
fn empty_variant_is_rejected() {
    let err = Schema::new(TypeNode::Variant(Vec::new())).unwrap_err();
    assert!(matches!(err, CodecError::SchemaViolation(_)));
}

#[test]
fn structural_ids_track_shape_not_identity() {
    let a = optional_field_schema();
    let b = optional_field_schema();
    let c = Schema::new(TypeNode::Tuple(vec![
        TypeNode::Prim(PrimKind::I64),
        TypeNode::Variant(vec![TypeNode::empty_tuple(), TypeNode::Prim(PrimKind::I32)]),
    ]))
    .unwrap();

    assert_eq!(a.id(), b.id());
    assert_ne!(a.id(), c.id());
}

#[test]
fn deleting_variant_shape_is_recognized() {
    let deleting = TypeNode::Variant(vec![TypeNode::Prim(PrimKind::Str), TypeNode::empty_tuple()]);
    let not_deleting = TypeNode::Variant(vec![TypeNode::empty_tuple(), TypeNode::Prim(PrimKind::Str)]);

    assert!(deleting.is_deleting_variant());
    assert!(!not_deleting.is_deleting_variant());
}

#[test]
fn consistency_checks_follow_dominator_chain() {
    // variant [ variant [ i32, i16 ], i64 ]
    let schema = Schema::new(TypeNode::Variant(vec![
        TypeNode::Variant(vec![TypeNode::Prim(PrimKind::I32), TypeNode::Prim(PrimKind::I16)]),
        TypeNode::Prim(PrimKind::I64),
    ]))
    .unwrap();

    // Inner variant is only reachable while the outer holds case 0.
    assert!(schema.choice_consistent(&[0, 0], 1));
    assert!(schema.choice_consistent(&[0, -1], 1));
    assert!(!schema.choice_consistent(&[1, 0], 1));
    assert!(!schema.choice_consistent(&[-1, 0], 1));

    // Field 0 (the i32) needs inner case 0; field 2 (the i64) needs outer
    // case 1.
    assert!(schema.field_consistent(&[0, 0], 0));
    assert!(!schema.field_consistent(&[0, 1], 0));
    assert!(schema.field_consistent(&[1, -1], 2));
    assert!(!schema.field_consistent(&[0, -1], 2));

    // A slice too short to record a dominator's choice reads as
    // inconsistent rather than panicking.
    assert!(!schema.choice_consistent(&[], 1));
    assert!(!schema.field_consistent(&[], 0));
}

#[test]
fn schema_set_resolves_registered_ids() {
    let schema = optional_field_schema();
    let mut set = SchemaSet::new();
    set.insert(Arc::clone(&schema));

    assert!(set.resolve(schema.id()).is_some());
    assert!(set.resolve(schema.id().wrapping_add(1)).is_none());
}
