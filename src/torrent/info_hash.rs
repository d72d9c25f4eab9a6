use super::{TorrentError, TorrentResult};
use crate::bencode;
use crate::bencode::BencodeValue;
use sha1::{Digest, Sha1};
use std::collections::HashMap;

/// Calculates the SHA-1 hash of a bencode-encoded info dictionary.
///
/// Takes the *raw* decoded `info` dictionary (not a re-serialization of a
/// typed record) so that fields a typed schema doesn't know about still
/// count toward the hash, re-encodes it canonically (sorted keys, minimal
/// integers), and hashes the result. This is the only correct way to
/// compute an info-hash: round-tripping through a typed `InfoDict` first
/// would silently drop any field the schema doesn't model.
pub fn calculate_info_hash(info_dict: &HashMap<Vec<u8>, BencodeValue>) -> TorrentResult<[u8; 20]> {
    let buffer = bencode::encoder::encode_to_vec(&BencodeValue::Dict(info_dict.clone()))
        .map_err(TorrentError::Bencode)?;

    let mut hasher = Sha1::new();
    hasher.update(&buffer);

    let result = hasher.finalize();
    let mut info_hash = [0u8; 20];
    info_hash.copy_from_slice(&result[..]);

    Ok(info_hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_file_info() -> HashMap<Vec<u8>, BencodeValue> {
        let mut dict = HashMap::new();
        dict.insert(b"length".to_vec(), BencodeValue::Integer(10));
        dict.insert(b"name".to_vec(), BencodeValue::String(b"test.txt".to_vec()));
        dict.insert(b"piece length".to_vec(), BencodeValue::Integer(4));
        dict.insert(b"pieces".to_vec(), BencodeValue::String(vec![b'A'; 20]));
        dict
    }

    #[test]
    fn matches_known_digest_for_a_fixed_info_dict() {
        let hash = calculate_info_hash(&single_file_info()).unwrap();
        assert_eq!(hex::encode(hash), "57a90733be52dc80d28d535dfbb8974704f1ef7f");
    }

    #[test]
    fn stable_regardless_of_source_hashmap_iteration_order() {
        // HashMap iteration order is not deterministic across instances
        // built differently, but the digest must only depend on the
        // logical dict contents (keys are sorted at encode time).
        let a = calculate_info_hash(&single_file_info()).unwrap();
        let mut rebuilt = HashMap::new();
        for (k, v) in single_file_info().into_iter().rev() {
            rebuilt.insert(k, v);
        }
        let b = calculate_info_hash(&rebuilt).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_fields_still_affect_the_hash() {
        let mut with_extra = single_file_info();
        with_extra.insert(b"private".to_vec(), BencodeValue::Integer(1));
        let a = calculate_info_hash(&single_file_info()).unwrap();
        let b = calculate_info_hash(&with_extra).unwrap();
        assert_ne!(a, b);
    }
}
