use super::*;
use pretty_assertions::assert_eq;

#[test]
fn round_trip_fixed_widths() {
    let mut buf = [0u8; 32];
    write_u16(&mut buf, 0, 0xBEEF).unwrap();
    write_i32(&mut buf, 2, -42).unwrap();
    write_u64(&mut buf, 6, 0x0123_4567_89AB_CDEF).unwrap();
    write_f64(&mut buf, 14, 2.5).unwrap();

    assert_eq!(read_u16(&buf, 0).unwrap(), 0xBEEF);
    assert_eq!(read_i32(&buf, 2).unwrap(), -42);
    assert_eq!(read_u64(&buf, 6).unwrap(), 0x0123_4567_89AB_CDEF);
    assert_eq!(read_f64(&buf, 14).unwrap(), 2.5);
}

#[test]
fn big_endian_byte_order() {
    let mut buf = [0u8; 4];
    write_i32(&mut buf, 0, 42).unwrap();
    assert_eq!(buf, [0x00, 0x00, 0x00, 0x2A]);
}

#[test]
fn truncated_read_is_an_error() {
    let buf = [0u8; 3];
    let err = read_u32(&buf, 0).unwrap_err();
    assert_eq!(
        err,
        WireError::Truncated {
            off: 0,
            want: 4,
            len: 3
        }
    );
}

#[test]
fn read_past_end_is_an_error() {
    let buf = [0u8; 8];
    assert!(read_u16(&buf, 7).is_err());
    assert!(read_bytes(&buf, 6, 3).is_err());
    assert!(read_bytes(&buf, 6, 2).is_ok());
}

#[test]
fn overflowing_write_is_an_error() {
    let mut buf = [0u8; 2];
    let err = write_u32(&mut buf, 0, 1).unwrap_err();
    assert_eq!(
        err,
        WireError::Overflow {
            off: 0,
            want: 4,
            len: 2
        }
    );
}

#[test]
fn offset_arithmetic_does_not_wrap() {
    let buf = [0u8; 8];
    // A huge offset must fail cleanly rather than wrap around.
    assert!(read_u32(&buf, usize::MAX - 2).is_err());
}
