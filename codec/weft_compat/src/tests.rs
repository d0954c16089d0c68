use std::sync::Arc;

use pretty_assertions::assert_eq;

use weft_message::{Environment, Message, Value};
use weft_schema::{CodecError, PrimKind, Schema, TypeNode};

use super::*;

/// `tuple { i32 }`: the older schema, field `x` only.
fn narrow_schema() -> Arc<Schema> {
    Schema::new(TypeNode::Tuple(vec![TypeNode::Prim(PrimKind::I32)])).unwrap()
}

/// `tuple { i32, variant [ tuple {}, i32 ] }`: the newer schema, where
/// `y` arrived as an optional field. Accessors: x = 0, y's i32 = 1, the
/// y variant = 2.
fn wide_schema() -> Arc<Schema> {
    Schema::new(TypeNode::Tuple(vec![
        TypeNode::Prim(PrimKind::I32),
        TypeNode::Variant(vec![TypeNode::empty_tuple(), TypeNode::Prim(PrimKind::I32)]),
    ]))
    .unwrap()
}

#[test]
fn prefix_fields_map_straight_across() {
    let map = CompatibilityMap::build(&narrow_schema(), &wide_schema()).unwrap();
    assert_eq!(map.access_schema_id(), narrow_schema().id());
    assert_eq!(map.accessor_count(), 1);
    assert_eq!(map.index(0), Some(0));
    assert_eq!(map.index(1), None);
}

#[test]
fn deleted_accessors_map_to_minus_one() {
    // Access side is the wider schema; y and its field have no home in
    // the narrow encoding.
    let map = CompatibilityMap::build(&wide_schema(), &narrow_schema()).unwrap();
    assert_eq!(map.accessor_count(), 3);
    assert_eq!(map.index(0), Some(0));
    assert_eq!(map.index(1), Some(-1));
    assert_eq!(map.index(2), Some(-1));
}

#[test]
fn mismatched_primitives_are_a_violation() {
    let a = Schema::new(TypeNode::Tuple(vec![TypeNode::Prim(PrimKind::I32)])).unwrap();
    let b = Schema::new(TypeNode::Tuple(vec![TypeNode::Prim(PrimKind::I64)])).unwrap();
    let err = CompatibilityMap::build(&a, &b).unwrap_err();
    assert!(matches!(err, CodecError::SchemaViolation(_)));
}

#[test]
fn extra_fields_must_be_droppable() {
    let a = Schema::new(TypeNode::Tuple(vec![
        TypeNode::Prim(PrimKind::I32),
        TypeNode::Prim(PrimKind::Str),
    ]))
    .unwrap();
    let b = narrow_schema();
    let err = CompatibilityMap::build(&a, &b).unwrap_err();
    assert!(matches!(err, CodecError::SchemaViolation(_)));
}

#[test]
fn variant_case_tables_cover_the_shorter_side() {
    // access variant [ tuple{}, i8 ] vs encoding variant [ tuple{}, i8, i16 ].
    let a = Schema::new(TypeNode::Variant(vec![
        TypeNode::empty_tuple(),
        TypeNode::Prim(PrimKind::I8),
    ]))
    .unwrap();
    let b = Schema::new(TypeNode::Variant(vec![
        TypeNode::empty_tuple(),
        TypeNode::Prim(PrimKind::I8),
        TypeNode::Prim(PrimKind::I16),
    ]))
    .unwrap();
    let map = CompatibilityMap::build(&a, &b).unwrap();

    // Fields: access i8 -> encoding i8; variant accessor 1 -> 2.
    assert_eq!(map.index(0), Some(0));
    assert_eq!(map.index(1), Some(2));
    // Shared cases translate; the encoding-only case does not.
    assert_eq!(map.translate_case_out(2, 1), 1);
    assert_eq!(map.translate_case_out(2, 2), -1);
    assert_eq!(map.translate_case_in(2, 1), 1);
}

#[test]
fn boxed_accessors_lift_through_the_map() {
    // Both sides share list [ variant [ i32, str ] ]; the encoding adds
    // a droppable trailing field, shifting its boxed range.
    let boxed_list = TypeNode::List(Box::new(TypeNode::Variant(vec![
        TypeNode::Prim(PrimKind::I32),
        TypeNode::Prim(PrimKind::Str),
    ])));
    let a = Schema::new(TypeNode::Tuple(vec![boxed_list.clone()])).unwrap();
    let b = Schema::new(TypeNode::Tuple(vec![
        boxed_list,
        TypeNode::Variant(vec![TypeNode::Prim(PrimKind::I64), TypeNode::empty_tuple()]),
    ]))
    .unwrap();
    let map = CompatibilityMap::build(&a, &b).unwrap();

    // Access boxed accessors 1..4 land at encoding 3..6.
    assert_eq!(map.index(0), Some(0));
    assert_eq!(map.index(1), Some(3));
    assert_eq!(map.index(2), Some(4));
    assert_eq!(map.index(3), Some(5));
}

#[test]
fn map_wire_form_round_trips() {
    let map = CompatibilityMap::build(&wide_schema(), &narrow_schema()).unwrap();
    let decoded = CompatibilityMap::decode(&map.encode()).unwrap();
    assert_eq!(decoded, *map);

    let remapped = {
        let a = Schema::new(TypeNode::Variant(vec![
            TypeNode::empty_tuple(),
            TypeNode::Prim(PrimKind::I8),
        ]))
        .unwrap();
        let b = Schema::new(TypeNode::Variant(vec![
            TypeNode::empty_tuple(),
            TypeNode::Prim(PrimKind::I8),
            TypeNode::Prim(PrimKind::I16),
        ]))
        .unwrap();
        CompatibilityMap::build(&a, &b).unwrap()
    };
    let decoded = CompatibilityMap::decode(&remapped.encode()).unwrap();
    assert_eq!(decoded, *remapped);
}

#[test]
fn cache_returns_shared_maps() {
    let cache = CompatCache::new();
    let first = cache.map_for(&narrow_schema(), &wide_schema()).unwrap();
    let second = cache.map_for(&narrow_schema(), &wide_schema()).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
}

#[test]
fn deleted_field_reads_absent_until_transcribed() {
    let env = Environment::new();
    let encoded = Message::new(&narrow_schema(), &env);
    encoded.set(0, Value::I32(7)).unwrap();
    let bytes = encoded.to_bytes().unwrap();

    let inner = Message::from_bytes(&narrow_schema(), bytes, &env).unwrap();
    let cache = CompatCache::new();
    let view = CompatibilityView::new(&wide_schema(), inner, &env, &cache).unwrap();

    assert!(view.is_translating());
    assert_eq!(view.get(0).unwrap(), Value::I32(7));
    assert!(!view.is_present(1).unwrap());
    let err = view.get_case(2).unwrap_err();
    assert!(matches!(err, CodecError::UninitializedAccess(_)));

    view.transcribe().unwrap();
    assert!(!view.is_translating());
    assert_eq!(view.get(0).unwrap(), Value::I32(7));
    // The unmapped variant defaulted to its first (empty) case.
    assert_eq!(view.get_case(2).unwrap(), 0);

    // The transcribed node re-encodes under the access schema.
    let bytes = view.message().to_bytes().unwrap();
    assert_eq!(bytes, vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x07]);
    let reread = Message::from_bytes(&wide_schema(), bytes, &env).unwrap();
    assert_eq!(reread.get(0).unwrap(), Value::I32(7));
}

#[test]
fn writing_a_deleted_accessor_transcribes_automatically() {
    let env = Environment::new();
    let encoded = Message::new(&narrow_schema(), &env);
    encoded.set(0, Value::I32(7)).unwrap();
    let inner =
        Message::from_bytes(&narrow_schema(), encoded.to_bytes().unwrap(), &env).unwrap();
    let cache = CompatCache::new();
    let view = CompatibilityView::new(&wide_schema(), inner, &env, &cache).unwrap();

    view.set(1, Value::I32(5)).unwrap();
    assert!(!view.is_translating());
    assert_eq!(view.get(1).unwrap(), Value::I32(5));
    assert_eq!(view.get_case(2).unwrap(), 1);
    assert_eq!(view.get(0).unwrap(), Value::I32(7));
}

#[test]
fn varying_writes_on_an_assembled_node_transcribe() {
    // Same field layout on both sides, but the access schema carries an
    // extra droppable field so the schemas differ.
    let encoding = Schema::new(TypeNode::Tuple(vec![TypeNode::Prim(PrimKind::Str)])).unwrap();
    let access = Schema::new(TypeNode::Tuple(vec![
        TypeNode::Prim(PrimKind::Str),
        TypeNode::Variant(vec![TypeNode::Prim(PrimKind::I32), TypeNode::empty_tuple()]),
    ]))
    .unwrap();

    let env = Environment::new();
    let encoded = Message::new(&encoding, &env);
    encoded.set(0, Value::Str("short".to_string())).unwrap();
    let inner = Message::from_bytes(&encoding, encoded.to_bytes().unwrap(), &env).unwrap();
    let cache = CompatCache::new();
    let view = CompatibilityView::new(&access, inner, &env, &cache).unwrap();

    assert!(view.is_translating());
    view.set(0, Value::Str("considerably longer".to_string()))
        .unwrap();
    assert!(!view.is_translating());
    assert_eq!(
        view.get(0).unwrap(),
        Value::Str("considerably longer".to_string())
    );
}

#[test]
fn case_changes_on_assembled_nodes_transcribe() {
    let a = Schema::new(TypeNode::Variant(vec![
        TypeNode::empty_tuple(),
        TypeNode::Prim(PrimKind::I8),
    ]))
    .unwrap();
    let b = Schema::new(TypeNode::Variant(vec![
        TypeNode::empty_tuple(),
        TypeNode::Prim(PrimKind::I8),
        TypeNode::Prim(PrimKind::I16),
    ]))
    .unwrap();

    let env = Environment::new();
    let built = Message::new(&b, &env);
    built.set_case(2, 1).unwrap();
    built.set(0, Value::I8(3)).unwrap();
    let inner = Message::from_bytes(&b, built.to_bytes().unwrap(), &env).unwrap();

    let cache = CompatCache::new();
    let view = CompatibilityView::new(&a, inner, &env, &cache).unwrap();
    assert!(view.is_translating());

    // Re-asserting the current case leaves the encoding bytes alone and
    // keeps the map in force.
    view.set_case(1, 1).unwrap();
    assert!(view.is_translating());
    assert_eq!(view.get(0).unwrap(), Value::I8(3));

    // Flipping the case would unassemble the encoding node under the
    // map, so the view transcribes first.
    view.set_case(1, 0).unwrap();
    assert!(!view.is_translating());
    assert_eq!(view.get_case(1).unwrap(), 0);
    assert_eq!(view.message().schema().unwrap().id(), a.id());
}

#[test]
fn case_translation_flows_both_ways_through_a_view() {
    let a = Schema::new(TypeNode::Variant(vec![
        TypeNode::empty_tuple(),
        TypeNode::Prim(PrimKind::I8),
    ]))
    .unwrap();
    let b = Schema::new(TypeNode::Variant(vec![
        TypeNode::empty_tuple(),
        TypeNode::Prim(PrimKind::I8),
        TypeNode::Prim(PrimKind::I16),
    ]))
    .unwrap();

    let env = Environment::new();
    let inner = Message::new(&b, &env);
    inner.set_case(2, 1).unwrap();
    inner.set(0, Value::I8(3)).unwrap();

    let cache = CompatCache::new();
    let view = CompatibilityView::new(&a, inner, &env, &cache).unwrap();
    assert_eq!(view.get_case(1).unwrap(), 1);
    assert_eq!(view.get(0).unwrap(), Value::I8(3));

    view.set_case(1, 0).unwrap();
    assert!(view.is_translating());
    assert_eq!(view.get_case(1).unwrap(), 0);
}

#[test]
fn encoding_only_cases_read_as_uninitialized() {
    let a = Schema::new(TypeNode::Variant(vec![
        TypeNode::empty_tuple(),
        TypeNode::Prim(PrimKind::I8),
    ]))
    .unwrap();
    let b = Schema::new(TypeNode::Variant(vec![
        TypeNode::empty_tuple(),
        TypeNode::Prim(PrimKind::I8),
        TypeNode::Prim(PrimKind::I16),
    ]))
    .unwrap();

    let env = Environment::new();
    let inner = Message::new(&b, &env);
    inner.set_case(2, 2).unwrap();
    inner.set(1, Value::I16(9)).unwrap();

    let cache = CompatCache::new();
    let view = CompatibilityView::new(&a, inner, &env, &cache).unwrap();
    let err = view.get_case(1).unwrap_err();
    assert!(matches!(err, CodecError::UninitializedAccess(_)));
}

#[test]
fn matching_schemas_start_as_pure_delegators() {
    let env = Environment::new();
    let inner = Message::new(&narrow_schema(), &env);
    inner.set(0, Value::I32(1)).unwrap();
    let cache = CompatCache::new();
    let view = CompatibilityView::new(&narrow_schema(), inner, &env, &cache).unwrap();

    assert!(!view.is_translating());
    assert_eq!(view.get(0).unwrap(), Value::I32(1));
    view.set(0, Value::I32(2)).unwrap();
    assert_eq!(view.get(0).unwrap(), Value::I32(2));
}

#[test]
fn transcription_carries_part_lists() {
    // tuple { list [ tuple { i32 } ] } on both sides; the access side
    // adds a droppable field.
    let part_list = TypeNode::List(Box::new(TypeNode::Tuple(vec![TypeNode::Prim(
        PrimKind::I32,
    )])));
    let encoding = Schema::new(TypeNode::Tuple(vec![part_list.clone()])).unwrap();
    let access = Schema::new(TypeNode::Tuple(vec![
        part_list,
        TypeNode::Variant(vec![TypeNode::Prim(PrimKind::Str), TypeNode::empty_tuple()]),
    ]))
    .unwrap();

    let env = Environment::new();
    let inner = Message::new(&encoding, &env);
    inner.create_part_list(0, 2).unwrap();
    inner.get_part(0, 0).unwrap().set(0, Value::I32(10)).unwrap();
    inner.get_part(0, 1).unwrap().set(0, Value::I32(20)).unwrap();

    let cache = CompatCache::new();
    let view = CompatibilityView::new(&access, inner, &env, &cache).unwrap();
    view.transcribe().unwrap();

    let message = view.message();
    assert_eq!(message.schema().unwrap().id(), access.id());
    assert_eq!(message.list_len(0).unwrap(), 2);
    assert_eq!(
        message.get_part(0, 1).unwrap().get(0).unwrap(),
        Value::I32(20)
    );
}
