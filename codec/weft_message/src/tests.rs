use std::sync::Arc;

use pretty_assertions::assert_eq;
use proptest::prelude::*;

use weft_schema::{CodecError, PrimKind, Schema, SchemaSet, TypeNode};

use super::*;

/// `tuple { i32, variant [ tuple {}, i32 ] }`: accessor 0 is the i32,
/// accessor 1 the case-1 i32, accessor 2 the variant.
fn optional_field_schema() -> Arc<Schema> {
    Schema::new(TypeNode::Tuple(vec![
        TypeNode::Prim(PrimKind::I32),
        TypeNode::Variant(vec![TypeNode::empty_tuple(), TypeNode::Prim(PrimKind::I32)]),
    ]))
    .unwrap()
}

/// `tuple { i32, str, bytes }`
fn mixed_schema() -> Arc<Schema> {
    Schema::new(TypeNode::Tuple(vec![
        TypeNode::Prim(PrimKind::I32),
        TypeNode::Prim(PrimKind::Str),
        TypeNode::Prim(PrimKind::Bytes),
    ]))
    .unwrap()
}

#[test]
fn optional_case_zero_encodes_one_choice_byte_and_the_field() {
    let env = Environment::new();
    let message = Message::new(&optional_field_schema(), &env);
    message.set(0, Value::I32(42)).unwrap();
    message.set_case(2, 0).unwrap();

    let bytes = message.to_bytes().unwrap();
    assert_eq!(bytes, vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2A]);
}

#[test]
fn optional_case_one_appends_the_second_field() {
    let env = Environment::new();
    let message = Message::new(&optional_field_schema(), &env);
    message.set(0, Value::I32(42)).unwrap();
    message.set_case(2, 1).unwrap();
    message.set(1, Value::I32(99)).unwrap();

    let bytes = message.to_bytes().unwrap();
    assert_eq!(
        bytes,
        vec![0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0x2A, 0x00, 0x00, 0x00, 0x63]
    );
}

#[test]
fn encoding_without_a_chosen_case_is_rejected() {
    let env = Environment::new();
    let message = Message::new(&optional_field_schema(), &env);
    message.set(0, Value::I32(1)).unwrap();

    let err = message.to_bytes().unwrap_err();
    assert!(matches!(err, CodecError::UninitializedAccess(_)));
}

#[test]
fn values_round_trip_through_bytes() {
    let env = Environment::new();
    let message = Message::new(&mixed_schema(), &env);
    message.set(0, Value::I32(-7)).unwrap();
    message.set(1, Value::Str("hello".to_string())).unwrap();
    message.set(2, Value::Bytes(vec![1, 2, 3])).unwrap();

    let bytes = message.to_bytes().unwrap();
    let decoded = Message::from_bytes(&mixed_schema(), bytes, &env).unwrap();
    assert_eq!(decoded.get(0).unwrap(), Value::I32(-7));
    assert_eq!(decoded.get(1).unwrap(), Value::Str("hello".to_string()));
    assert_eq!(decoded.get(2).unwrap(), Value::Bytes(vec![1, 2, 3]));
    // Second read comes from the cache, same answer.
    assert_eq!(decoded.get(1).unwrap(), Value::Str("hello".to_string()));
}

#[test]
fn null_round_trips_for_varying_fields_only() {
    let env = Environment::new();
    let message = Message::new(&mixed_schema(), &env);
    message.set(0, Value::I32(1)).unwrap();
    message.set(1, Value::Null).unwrap();
    message.set(2, Value::Bytes(Vec::new())).unwrap();

    let bytes = message.to_bytes().unwrap();
    let decoded = Message::from_bytes(&mixed_schema(), bytes, &env).unwrap();
    assert_eq!(decoded.get(1).unwrap(), Value::Null);
    assert_eq!(decoded.get(2).unwrap(), Value::Bytes(Vec::new()));

    let err = message.set(0, Value::Null).unwrap_err();
    assert!(matches!(err, CodecError::SchemaViolation(_)));
}

#[test]
fn fixed_width_writes_land_in_place() {
    let env = Environment::new();
    let message = Message::new(&mixed_schema(), &env);
    message.set(0, Value::I32(1)).unwrap();
    message.set(1, Value::Str("abc".to_string())).unwrap();
    message.set(2, Value::Bytes(vec![9])).unwrap();
    let before = message.to_bytes().unwrap();

    message.set(0, Value::I32(0x0102_0304)).unwrap();
    let after = message.to_bytes().unwrap();
    assert_eq!(before.len(), after.len());
    // Body: u16 choice len, 1 choice byte, 1 table entry, then the i32.
    assert_eq!(before[..7], after[..7]);
    assert_eq!(after[7..11], 0x0102_0304u32.to_be_bytes());
    assert_eq!(before[11..], after[11..]);
}

#[test]
fn growing_a_varying_field_splices_the_root_buffer() {
    let env = Environment::new();
    let message = Message::new(&mixed_schema(), &env);
    message.set(0, Value::I32(5)).unwrap();
    message.set(1, Value::Str("ab".to_string())).unwrap();
    message.set(2, Value::Bytes(vec![7, 7])).unwrap();
    let short = message.to_bytes().unwrap();

    // Root is now assembled; growing the string resizes in place.
    message.set(1, Value::Str("abcdef".to_string())).unwrap();
    let long = message.to_bytes().unwrap();
    assert_eq!(long.len(), short.len() + 4);
    assert_eq!(message.get(0).unwrap(), Value::I32(5));
    assert_eq!(message.get(1).unwrap(), Value::Str("abcdef".to_string()));
    assert_eq!(message.get(2).unwrap(), Value::Bytes(vec![7, 7]));

    let decoded = Message::from_bytes(&mixed_schema(), long, &env).unwrap();
    assert_eq!(decoded.get(1).unwrap(), Value::Str("abcdef".to_string()));
    assert_eq!(decoded.get(2).unwrap(), Value::Bytes(vec![7, 7]));
}

#[test]
fn encoded_len_matches_serialization() {
    let env = Environment::new();
    let message = Message::new(&mixed_schema(), &env);
    message.set(0, Value::I32(5)).unwrap();
    message.set(1, Value::Str("xyz".to_string())).unwrap();
    message.set(2, Value::Null).unwrap();

    let predicted = message.encoded_len().unwrap();
    assert_eq!(predicted, message.to_bytes().unwrap().len());
}

#[test]
fn setting_a_dependent_field_forces_its_dominating_case() {
    let env = Environment::new();
    let message = Message::new(&optional_field_schema(), &env);
    message.set(0, Value::I32(1)).unwrap();
    message.set(1, Value::I32(2)).unwrap();

    assert_eq!(message.get_case(2).unwrap(), 1);
    assert!(message.is_present(1).unwrap());

    // Flipping the case back orphans the dependent field.
    message.set_case(2, 0).unwrap();
    assert!(!message.is_present(1).unwrap());
    let err = message.get(1).unwrap_err();
    assert!(matches!(err, CodecError::UninitializedAccess(_)));
}

#[test]
fn absent_fields_read_as_uninitialized_after_decode() {
    let env = Environment::new();
    let bytes = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2A];
    let message = Message::from_bytes(&optional_field_schema(), bytes, &env).unwrap();

    assert_eq!(message.get_case(2).unwrap(), 0);
    assert!(!message.is_present(1).unwrap());
    let err = message.get(1).unwrap_err();
    assert!(matches!(err, CodecError::UninitializedAccess(_)));
}

#[test]
fn unassembly_is_idempotent_and_lossless() {
    let env = Environment::new();
    let message = Message::new(&mixed_schema(), &env);
    message.set(0, Value::I32(11)).unwrap();
    message.set(1, Value::Str("keep".to_string())).unwrap();
    message.set(2, Value::Bytes(vec![4, 5])).unwrap();
    let bytes = message.to_bytes().unwrap();

    let decoded = Message::from_bytes(&mixed_schema(), bytes.clone(), &env).unwrap();
    decoded.unassemble().unwrap();
    decoded.unassemble().unwrap();
    assert_eq!(decoded.get(1).unwrap(), Value::Str("keep".to_string()));
    assert_eq!(decoded.to_bytes().unwrap(), bytes);
}

#[test]
fn copies_are_isolated_after_mutation() {
    let env = Environment::new();
    let message = Message::new(&mixed_schema(), &env);
    message.set(0, Value::I32(1)).unwrap();
    message.set(1, Value::Str("one".to_string())).unwrap();
    message.set(2, Value::Null).unwrap();
    message.to_bytes().unwrap();

    let copy = message.copy().unwrap();
    copy.set(0, Value::I32(2)).unwrap();
    copy.set(1, Value::Str("two".to_string())).unwrap();

    assert_eq!(message.get(0).unwrap(), Value::I32(1));
    assert_eq!(message.get(1).unwrap(), Value::Str("one".to_string()));
    assert_eq!(copy.get(0).unwrap(), Value::I32(2));
    assert_eq!(copy.get(1).unwrap(), Value::Str("two".to_string()));
}

#[test]
fn copying_an_unassembled_tree_also_isolates() {
    let env = Environment::new();
    let message = Message::new(&mixed_schema(), &env);
    message.set(0, Value::I32(1)).unwrap();
    message.set(1, Value::Null).unwrap();
    message.set(2, Value::Null).unwrap();

    let copy = message.copy().unwrap();
    message.set(0, Value::I32(9)).unwrap();
    assert_eq!(copy.get(0).unwrap(), Value::I32(1));
}

#[test]
fn part_lists_round_trip_and_hand_out_part_handles() {
    // tuple { list [ tuple { i32, str } ] }
    let schema = Schema::new(TypeNode::Tuple(vec![TypeNode::List(Box::new(
        TypeNode::Tuple(vec![
            TypeNode::Prim(PrimKind::I32),
            TypeNode::Prim(PrimKind::Str),
        ]),
    ))]))
    .unwrap();
    let env = Environment::new();
    let message = Message::new(&schema, &env);
    message.create_part_list(0, 2).unwrap();
    for (i, (n, s)) in [(10, "a"), (20, "bb")].iter().enumerate() {
        let part = message.get_part(0, i).unwrap();
        part.set(0, Value::I32(*n)).unwrap();
        part.set(1, Value::Str(s.to_string())).unwrap();
    }

    let bytes = message.to_bytes().unwrap();
    let decoded = Message::from_bytes(&schema, bytes, &env).unwrap();
    assert_eq!(decoded.list_len(0).unwrap(), 2);
    let part = decoded.get_part(0, 1).unwrap();
    assert_eq!(part.get(0).unwrap(), Value::I32(20));
    assert_eq!(part.get(1).unwrap(), Value::Str("bb".to_string()));
}

#[test]
fn writes_through_part_handles_reach_the_root_encoding() {
    let schema = Schema::new(TypeNode::Tuple(vec![TypeNode::List(Box::new(
        TypeNode::Tuple(vec![TypeNode::Prim(PrimKind::I32)]),
    ))]))
    .unwrap();
    let env = Environment::new();
    let message = Message::new(&schema, &env);
    message.create_part_list(0, 1).unwrap();
    message.get_part(0, 0).unwrap().set(0, Value::I32(1)).unwrap();
    message.to_bytes().unwrap();

    // Mutate through a part handle while the root is assembled.
    let part = message.get_part(0, 0).unwrap();
    part.set(0, Value::I32(42)).unwrap();
    let bytes = message.to_bytes().unwrap();
    let decoded = Message::from_bytes(&schema, bytes, &env).unwrap();
    assert_eq!(
        decoded.get_part(0, 0).unwrap().get(0).unwrap(),
        Value::I32(42)
    );
}

#[test]
fn copying_a_part_handle_detaches_an_independent_tree() {
    let schema = Schema::new(TypeNode::Tuple(vec![TypeNode::List(Box::new(
        TypeNode::Tuple(vec![TypeNode::Prim(PrimKind::I32)]),
    ))]))
    .unwrap();
    let env = Environment::new();
    let message = Message::new(&schema, &env);
    message.create_part_list(0, 1).unwrap();
    let part = message.get_part(0, 0).unwrap();
    part.set(0, Value::I32(5)).unwrap();

    let detached = part.copy().unwrap();
    detached.set(0, Value::I32(6)).unwrap();
    assert_eq!(part.get(0).unwrap(), Value::I32(5));
    assert_eq!(detached.get(0).unwrap(), Value::I32(6));
}

#[test]
fn boxed_accessors_fan_out_across_the_box_list() {
    // tuple { list [ variant [ i32, str ] ] }: boxed accessors 1 (i32),
    // 2 (str), 3 (the variant itself).
    let schema = Schema::new(TypeNode::Tuple(vec![TypeNode::List(Box::new(
        TypeNode::Variant(vec![
            TypeNode::Prim(PrimKind::I32),
            TypeNode::Prim(PrimKind::Str),
        ]),
    ))]))
    .unwrap();
    let env = Environment::new();
    let message = Message::new(&schema, &env);
    message.create_part_list(0, 3).unwrap();
    message
        .set(
            3,
            Value::List(vec![Value::I32(0), Value::I32(0), Value::I32(0)]),
        )
        .unwrap();
    message
        .set(
            1,
            Value::List(vec![Value::I32(7), Value::I32(8), Value::I32(9)]),
        )
        .unwrap();

    assert_eq!(
        message.get(1).unwrap(),
        Value::List(vec![Value::I32(7), Value::I32(8), Value::I32(9)])
    );
    assert_eq!(
        message.get(3).unwrap(),
        Value::List(vec![Value::I32(0), Value::I32(0), Value::I32(0)])
    );

    let bytes = message.to_bytes().unwrap();
    let decoded = Message::from_bytes(&schema, bytes, &env).unwrap();
    assert_eq!(
        decoded.get(1).unwrap(),
        Value::List(vec![Value::I32(7), Value::I32(8), Value::I32(9)])
    );

    // Flipping one element's case through its part handle orphans its
    // i32, so the fan-out read fails on that element.
    let part = decoded.get_part(0, 1).unwrap();
    part.set(1, Value::Str("s".to_string())).unwrap();
    let err = decoded.get(1).unwrap_err();
    assert!(matches!(err, CodecError::UninitializedAccess(_)));
}

#[test]
fn boxed_writes_require_one_item_per_element() {
    let schema = Schema::new(TypeNode::Tuple(vec![TypeNode::List(Box::new(
        TypeNode::Variant(vec![
            TypeNode::Prim(PrimKind::I32),
            TypeNode::Prim(PrimKind::Str),
        ]),
    ))]))
    .unwrap();
    let env = Environment::new();
    let message = Message::new(&schema, &env);
    message.create_part_list(0, 2).unwrap();

    let err = message
        .set(1, Value::List(vec![Value::I32(1)]))
        .unwrap_err();
    assert!(matches!(err, CodecError::SchemaViolation(_)));
}

fn dynamic_fixture() -> (Arc<Schema>, Arc<Schema>, Environment) {
    let inner = Schema::new(TypeNode::Tuple(vec![TypeNode::Prim(PrimKind::I32)])).unwrap();
    let outer = Schema::new(TypeNode::Tuple(vec![TypeNode::Dynamic])).unwrap();
    let mut set = SchemaSet::new();
    set.insert(Arc::clone(&inner));
    let env = Environment::with_resolver(Arc::new(set));
    (outer, inner, env)
}

#[test]
fn dynamic_fields_round_trip_with_a_resolver() {
    let (outer, inner, env) = dynamic_fixture();
    let message = Message::new(&outer, &env);
    let part = message.init_dynamic(0, &inner).unwrap();
    part.set(0, Value::I32(5)).unwrap();

    assert_eq!(message.schemata().unwrap(), vec![inner.id()]);
    let bytes = message.to_bytes().unwrap();
    let decoded = Message::from_bytes(&outer, bytes, &env).unwrap();
    let part = decoded.get_message(0).unwrap();
    assert_eq!(part.schema().unwrap().id(), inner.id());
    assert_eq!(part.get(0).unwrap(), Value::I32(5));
    assert_eq!(decoded.schemata().unwrap(), vec![inner.id()]);
}

#[test]
fn unresolved_dynamic_content_stays_opaque_but_reencodes() {
    let (outer, inner, env) = dynamic_fixture();
    let message = Message::new(&outer, &env);
    message.init_dynamic(0, &inner).unwrap().set(0, Value::I32(5)).unwrap();
    let bytes = message.to_bytes().unwrap();

    let blind = Environment::new();
    let decoded = Message::from_bytes(&outer, bytes.clone(), &blind).unwrap();
    let err = decoded.get_message(0).unwrap_err();
    assert!(matches!(err, CodecError::ModelNotImplemented(id) if id == inner.id()));
    // The id is still reported and the bytes survive re-encoding.
    assert_eq!(decoded.schemata().unwrap(), vec![inner.id()]);
    decoded.unassemble().unwrap();
    assert_eq!(decoded.to_bytes().unwrap(), bytes);
}

#[test]
fn framed_form_carries_the_dependent_schema_table() {
    let (outer, inner, env) = dynamic_fixture();
    let message = Message::new(&outer, &env);
    message.init_dynamic(0, &inner).unwrap().set(0, Value::I32(3)).unwrap();

    let frame = message.to_frame().unwrap();
    assert_eq!(&frame[0..2], &[0x00, 0x01]);
    assert_eq!(frame[2..10], inner.id().to_be_bytes());

    let decoded = Message::from_frame(&outer, &frame, &env).unwrap();
    assert_eq!(decoded.schemata().unwrap(), vec![inner.id()]);
    assert_eq!(
        decoded.get_message(0).unwrap().get(0).unwrap(),
        Value::I32(3)
    );
}

#[test]
fn frame_table_tracks_mutations_after_schemata_reads() {
    let first = Schema::new(TypeNode::Tuple(vec![TypeNode::Prim(PrimKind::I32)])).unwrap();
    let second = Schema::new(TypeNode::Tuple(vec![TypeNode::Prim(PrimKind::I64)])).unwrap();
    let outer = Schema::new(TypeNode::Tuple(vec![TypeNode::Dynamic])).unwrap();
    let mut set = SchemaSet::new();
    set.insert(Arc::clone(&first));
    set.insert(Arc::clone(&second));
    let env = Environment::with_resolver(Arc::new(set));

    let message = Message::new(&outer, &env);
    message.init_dynamic(0, &first).unwrap().set(0, Value::I32(1)).unwrap();
    assert_eq!(message.schemata().unwrap(), vec![first.id()]);

    // Swapping the part after the id table was memoized must still
    // yield a frame whose table matches its body.
    message.init_dynamic(0, &second).unwrap().set(0, Value::I64(2)).unwrap();
    let frame = message.to_frame().unwrap();
    assert_eq!(&frame[0..2], &[0x00, 0x01]);
    assert_eq!(frame[2..10], second.id().to_be_bytes());

    let decoded = Message::from_frame(&outer, &frame, &env).unwrap();
    assert_eq!(
        decoded.get_message(0).unwrap().get(0).unwrap(),
        Value::I64(2)
    );
}

#[test]
fn dynamic_list_elements_carry_their_own_schemas() {
    let inner = Schema::new(TypeNode::Tuple(vec![TypeNode::Prim(PrimKind::I32)])).unwrap();
    let outer = Schema::new(TypeNode::Tuple(vec![TypeNode::List(Box::new(
        TypeNode::Dynamic,
    ))]))
    .unwrap();
    let mut set = SchemaSet::new();
    set.insert(Arc::clone(&inner));
    let env = Environment::with_resolver(Arc::new(set));

    let message = Message::new(&outer, &env);
    message.create_part_list(0, 2).unwrap();
    for i in 0..2 {
        let part = message.init_dynamic_elem(0, i, &inner).unwrap();
        part.set(0, Value::I32(i as i32)).unwrap();
    }

    let bytes = message.to_bytes().unwrap();
    let decoded = Message::from_bytes(&outer, bytes, &env).unwrap();
    assert_eq!(decoded.list_len(0).unwrap(), 2);
    assert_eq!(
        decoded.get_part(0, 1).unwrap().get(0).unwrap(),
        Value::I32(1)
    );
    assert_eq!(decoded.schemata().unwrap(), vec![inner.id()]);
}

#[test]
fn set_message_embeds_a_deep_copy() {
    let (outer, inner, env) = dynamic_fixture();
    let source = Message::new(&inner, &env);
    source.set(0, Value::I32(1)).unwrap();

    let dest = Message::new(&outer, &env);
    dest.set_message(0, &source).unwrap();
    source.set(0, Value::I32(2)).unwrap();

    assert_eq!(
        dest.get_message(0).unwrap().get(0).unwrap(),
        Value::I32(1)
    );
}

#[test]
fn unassembled_estimate_counts_only_what_is_set() {
    let env = Environment::new();
    let message = Message::new(&optional_field_schema(), &env);
    message.set(0, Value::I32(1)).unwrap();
    message.set_case(2, 0).unwrap();
    assert_eq!(message.unassembled_estimate().unwrap(), 4);

    message.set(1, Value::I32(2)).unwrap();
    assert_eq!(message.unassembled_estimate().unwrap(), 8);
}

#[test]
fn corrupt_bodies_error_instead_of_panicking() {
    let env = Environment::new();
    let schema = mixed_schema();
    let message = Message::new(&schema, &env);
    message.set(0, Value::I32(1)).unwrap();
    message.set(1, Value::Str("hello".to_string())).unwrap();
    message.set(2, Value::Bytes(vec![1, 2, 3, 4])).unwrap();
    let good = message.to_bytes().unwrap();

    for cut in 0..good.len() {
        let truncated = good[..cut].to_vec();
        if let Ok(decoded) = Message::from_bytes(&schema, truncated, &env) {
            for accessor in 0..3 {
                let _ = decoded.get(accessor);
            }
        }
    }

    // A list whose count overruns its payload must be rejected before
    // any allocation happens.
    let list_schema = Schema::new(TypeNode::Tuple(vec![TypeNode::List(Box::new(
        TypeNode::Prim(PrimKind::I32),
    ))]))
    .unwrap();
    let list_message = Message::new(&list_schema, &env);
    list_message
        .set(0, Value::List(vec![Value::I32(1)]))
        .unwrap();
    let mut bytes = list_message.to_bytes().unwrap();
    let count_at = bytes.len() - 8;
    bytes[count_at..count_at + 4].copy_from_slice(&u32::MAX.to_be_bytes());
    let decoded = Message::from_bytes(&list_schema, bytes, &env).unwrap();
    let err = decoded.get(0).unwrap_err();
    assert!(matches!(err, CodecError::MessageCorruption(_)));
}

proptest! {
    #[test]
    fn mixed_bodies_round_trip(
        n in any::<i32>(),
        s in proptest::option::of("[a-z]{0,24}"),
        b in proptest::collection::vec(any::<u8>(), 0..32),
    ) {
        let env = Environment::new();
        let schema = mixed_schema();
        let message = Message::new(&schema, &env);
        message.set(0, Value::I32(n)).unwrap();
        let text = match &s {
            Some(text) => Value::Str(text.clone()),
            None => Value::Null,
        };
        message.set(1, text.clone()).unwrap();
        message.set(2, Value::Bytes(b.clone())).unwrap();

        let bytes = message.to_bytes().unwrap();
        prop_assert_eq!(bytes.len(), message.encoded_len().unwrap());
        let decoded = Message::from_bytes(&schema, bytes, &env).unwrap();
        prop_assert_eq!(decoded.get(0).unwrap(), Value::I32(n));
        prop_assert_eq!(decoded.get(1).unwrap(), text);
        prop_assert_eq!(decoded.get(2).unwrap(), Value::Bytes(b));
    }
}
