/// End of used content per bank in the English Oracle of Ages image.
/// Banks not listed have no free space worth using.
pub const AGES_END_OF_BANK: &[(u8, u16)] = &[
    (0x00, 0x3ef8),
    (0x01, 0x7fc3),
    (0x02, 0x7e93),
    (0x03, 0x7ebd),
    (0x04, 0x7edb),
    (0x05, 0x7d9d),
    (0x06, 0x7a31),
    (0x08, 0x7f60),
    (0x09, 0x7dee),
    (0x0a, 0x7e09),
    (0x0b, 0x7fa8),
    (0x0c, 0x7f94),
    (0x0f, 0x7f90),
    (0x10, 0x7ef4),
    (0x11, 0x7f73),
    (0x12, 0x7e8f),
    (0x15, 0x7bfb),
    (0x16, 0x7e03),
    (0x38, 0x6b00), // to be safe
    (0x3f, 0x7d0a),
];
