use ovlnet::models::identifier::{BASE32_LEN, HASH_SIZE, Identifier};

#[test]
fn base32_roundtrip_for_random_identifiers() {
    for _ in 0..64 {
        let id = Identifier::random();
        let code = id.to_base32();
        assert_eq!(code.len(), BASE32_LEN);
        assert!(code.chars().all(|c| c.is_ascii_lowercase() || ('2'..='9').contains(&c)));
        assert_eq!(Identifier::from_base32(&code), id);
    }
}

#[test]
fn hex_roundtrip_for_random_identifiers() {
    for _ in 0..64 {
        let id = Identifier::random();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 2 * HASH_SIZE);
        assert_eq!(Identifier::from_hex(&hex).expect("valid hex"), id);
    }
}

#[test]
fn zero_identifier_encodes_to_all_a() {
    let code = Identifier::ZERO.to_base32();
    assert_eq!(code, "a".repeat(BASE32_LEN));
    assert!(Identifier::from_base32(&code).is_zero());
}

#[test]
fn wrong_length_base32_decodes_to_zero() {
    assert!(Identifier::from_base32("tooshort").is_zero());
    let long = "a".repeat(BASE32_LEN + 1);
    assert!(Identifier::from_base32(&long).is_zero());
}

#[test]
fn bad_hex_is_an_error() {
    assert!(Identifier::from_hex("zz").is_err());
    assert!(Identifier::from_hex(&"f".repeat(39)).is_err());
}

#[test]
fn distance_is_symmetric() {
    for _ in 0..32 {
        let a = Identifier::random();
        let b = Identifier::random();
        assert_eq!(a.distance(&b), b.distance(&a));
    }
}

#[test]
fn self_distance_has_no_leading_bit() {
    let a = Identifier::random();
    let d = a.distance(&a);
    assert!(d.is_zero());
    assert_eq!(d.leading_bit(), 8 * HASH_SIZE);
}

#[test]
fn leading_bit_walks_the_prefix() {
    let zero = Identifier::ZERO;
    for prefix in [0usize, 1, 7, 8, 63, 159] {
        let mut bytes = [0u8; HASH_SIZE];
        bytes[prefix / 8] = 0x80 >> (prefix % 8);
        let id = Identifier::from_bytes(bytes);
        let d = zero.distance(&id);
        assert_eq!(d.leading_bit(), prefix);
        assert!(d.bit(prefix));
        if prefix > 0 {
            assert!(!d.bit(prefix - 1));
        }
    }
}
