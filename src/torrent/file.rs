//! Torrent file structure and parsing logic.
//!
//! This module defines the TorrentFile struct and related helpers for parsing, validating, and working with .torrent file metadata.
use crate::bencode::{self, BencodeValue};
use crate::torrent::info_hash;

use super::{TorrentError, TorrentResult};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, PartialEq, Clone)]
pub struct TorrentFile {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<SystemTime>,
    pub comment: String,
    pub created_by: String,
    pub encoding: String,
    pub info: InfoDict,
    pub info_hash: [u8; 20],
    pub pieces_hash: Vec<[u8; 20]>,
}

#[derive(Debug, PartialEq, Clone)]
pub struct InfoDict {
    pub piece_length: i64,
    pub pieces: Vec<u8>,
    pub private: bool,
    pub name: String,
    pub length: Option<i64>,
    pub files: Vec<FileDict>,
    pub is_directory: bool,
}

#[derive(Debug, PartialEq, Clone)]
pub struct FileDict {
    pub length: i64,
    pub path: Vec<String>,
}

/**
Parses the concatenated SHA-1 hashes from the `pieces` string.

# Torrent Protocol Context:
The `pieces` key within the `info` dictionary is a single string (byte sequence)
that is a concatenation of 20-byte SHA-1 hashes for each piece of the torrent.
This function breaks that long string into individual 20-byte hash arrays.
The order of these hashes is crucial as it corresponds directly to the piece index.
*/
#[tracing::instrument(level = "trace")]
fn parse_pieces(pieces_bytes: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces_bytes.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    let num_pieces = pieces_bytes.len() / 20;
    let mut hashes = Vec::with_capacity(num_pieces);
    for i in 0..num_pieces {
        let start = i * 20;
        let end = start + 20;

        let mut hash_array = [0u8; 20];
        hash_array.copy_from_slice(&pieces_bytes[start..end]);
        hashes.push(hash_array);
    }
    Ok(hashes)
}

/// Parses the announce-list from the torrent file: a list of tiers, each a
/// list of tracker URL strings.
fn parse_announce_list(value: BencodeValue) -> TorrentResult<Vec<Vec<String>>> {
    match value {
        BencodeValue::List(tiers) => {
            let mut result = Vec::new();
            for tier in tiers {
                match tier {
                    BencodeValue::List(trackers) => {
                        let mut tier_vec = Vec::new();
                        for tracker in trackers {
                            match tracker {
                                BencodeValue::String(s) => {
                                    tier_vec.push(String::from_utf8(s).map_err(|e| {
                                        TorrentError::InvalidFormat(format!(
                                            "Invalid tracker URL (not UTF-8): {}",
                                            e
                                        ))
                                    })?);
                                }
                                _ => {
                                    return Err(TorrentError::InvalidFormat(
                                        "Tracker URL not a string".to_string(),
                                    ));
                                }
                            }
                        }
                        result.push(tier_vec);
                    }
                    _ => {
                        return Err(TorrentError::InvalidFormat(
                            "Announce tier not a list".to_string(),
                        ));
                    }
                }
            }
            Ok(result)
        }
        _ => Err(TorrentError::InvalidFormat("Announce-list not a list".to_string())),
    }
}

/// Parses the `info` dictionary into a typed [`InfoDict`], validating that
/// exactly one of `length`/`files` ends up meaningful.
fn parse_info_dict(value: BencodeValue) -> TorrentResult<InfoDict> {
    let dict = match value {
        BencodeValue::Dict(d) => d,
        _ => return Err(TorrentError::InvalidFormat("Info is not a dictionary".to_string())),
    };

    let piece_length = match dict.get(&b"piece length".to_vec()) {
        Some(BencodeValue::Integer(i)) => *i,
        _ => return Err(TorrentError::MissingField("piece length".to_string())),
    };

    let pieces_bytes = match dict.get(&b"pieces".to_vec()) {
        Some(BencodeValue::String(s)) => s.clone(),
        _ => return Err(TorrentError::MissingField("pieces".to_string())),
    };

    let private = matches!(dict.get(&b"private".to_vec()), Some(BencodeValue::Integer(1)));

    let name = match dict.get(&b"name".to_vec()) {
        Some(BencodeValue::String(s)) => String::from_utf8(s.clone())
            .map_err(|e| TorrentError::InvalidFormat(format!("Invalid name (not UTF-8): {}", e)))?,
        _ => return Err(TorrentError::MissingField("name".to_string())),
    };

    let length = match dict.get(&b"length".to_vec()) {
        Some(BencodeValue::Integer(i)) => Some(*i),
        _ => None,
    };

    let files = match dict.get(&b"files".to_vec()) {
        Some(BencodeValue::List(list)) => {
            let mut files_vec = Vec::new();
            for file_val in list {
                let BencodeValue::Dict(file_dict) = file_val else {
                    return Err(TorrentError::InvalidFormat("File entry not a dict".to_string()));
                };

                let length = match file_dict.get(&b"length".to_vec()) {
                    Some(BencodeValue::Integer(i)) => *i,
                    _ => return Err(TorrentError::MissingField("file length".to_string())),
                };

                let path = match file_dict.get(&b"path".to_vec()) {
                    Some(BencodeValue::List(path_list)) => {
                        let mut path_vec = Vec::new();
                        for p in path_list {
                            let BencodeValue::String(s) = p else {
                                return Err(TorrentError::InvalidFormat(
                                    "File path component not a string".to_string(),
                                ));
                            };
                            path_vec.push(String::from_utf8(s.clone()).map_err(|e| {
                                TorrentError::InvalidFormat(format!(
                                    "Invalid file path (not UTF-8): {}",
                                    e
                                ))
                            })?);
                        }
                        path_vec
                    }
                    _ => return Err(TorrentError::MissingField("file path".to_string())),
                };

                files_vec.push(FileDict { length, path });
            }
            files_vec
        }
        _ => Vec::new(),
    };

    if length.is_some() == !files.is_empty() {
        return Err(TorrentError::InvalidFormat(
            "exactly one of length/files must be present".to_string(),
        ));
    }

    let is_directory = !files.is_empty();

    Ok(InfoDict {
        piece_length,
        pieces: pieces_bytes,
        private,
        name,
        length,
        files,
        is_directory,
    })
}

impl TorrentFile {
    /// Total content length across the single file or all multi-file entries.
    pub fn total_length(&self) -> i64 {
        if !self.info.is_directory {
            self.info.length.unwrap_or(0)
        } else {
            self.info.files.iter().map(|f| f.length).sum()
        }
    }

    /// Number of pieces, derived from the parsed `pieces_hash` (validated
    /// against `ceil(total_length/piece_length)` at parse time).
    pub fn num_pieces(&self) -> usize {
        self.pieces_hash.len()
    }

    /// Size in bytes of piece `index`; `0` if out of range. Only the last
    /// piece may be shorter than `piece_length`.
    pub fn piece_size(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index < self.num_pieces() - 1 {
            self.info.piece_length
        } else {
            let total_length = self.total_length();
            let full_pieces_length = (self.num_pieces() - 1) as i64 * self.info.piece_length;
            let last_piece_size = total_length - full_pieces_length;

            if last_piece_size == 0 && self.num_pieces() > 0 {
                self.info.piece_length
            } else {
                last_piece_size
            }
        }
    }

    /// Parses a decoded bencode value into a `TorrentFile`.
    ///
    /// The `info` subtree is hashed from its *raw* decoded form, never from
    /// a re-serialization of the typed [`InfoDict`], so unknown fields the
    /// typed record drops still count toward the info-hash.
    #[tracing::instrument(level = "debug")]
    pub fn parse(data: BencodeValue) -> TorrentResult<TorrentFile> {
        let mut dict = match data {
            BencodeValue::Dict(d) => d,
            _ => return Err(TorrentError::InvalidFormat("Root is not a dictionary".to_string())),
        };

        let announce_bytes = dict
            .remove(&b"announce".to_vec())
            .ok_or_else(|| TorrentError::MissingField("announce".to_string()))?;

        let announce = match announce_bytes {
            BencodeValue::String(s) => String::from_utf8(s).map_err(|e| {
                TorrentError::InvalidFormat(format!("Invalid announce Url (not UTF-8): {}", e))
            })?,
            _ => return Err(TorrentError::MissingField("announce(not string)".to_string())),
        };

        let info_dict_value = dict
            .remove(&b"info".to_vec())
            .ok_or_else(|| TorrentError::MissingField("info".to_string()))?;

        let info_dict_map = match &info_dict_value {
            BencodeValue::Dict(d) => d.clone(),
            _ => return Err(TorrentError::InvalidFormat("info is not a dict".to_string())),
        };

        let info = parse_info_dict(info_dict_value)?;

        let announce_list = if let Some(announce_list_value) = dict.remove(&b"announce-list".to_vec())
        {
            parse_announce_list(announce_list_value)?
        } else {
            Vec::new()
        };

        let creation_date = if let Some(data_value) = dict.remove(&b"creation date".to_vec()) {
            match data_value {
                BencodeValue::Integer(timestamp) => {
                    let secs = timestamp.try_into().map_err(|_| TorrentError::DateParseError)?;
                    let duration = std::time::Duration::from_secs(secs);
                    Some(UNIX_EPOCH + duration)
                }
                _ => {
                    return Err(TorrentError::InvalidFormat(
                        "Creation date not an integer".to_string(),
                    ));
                }
            }
        } else {
            None
        };

        let comment = match dict.remove(&b"comment".to_vec()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let created_by = match dict.remove(&b"created by".to_vec()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };
        let encoding = match dict.remove(&b"encoding".to_vec()) {
            Some(BencodeValue::String(s)) => String::from_utf8(s).unwrap_or_default(),
            _ => String::new(),
        };

        let info_hash = info_hash::calculate_info_hash(&info_dict_map)?;
        let pieces_hash = parse_pieces(&info.pieces)?;

        let total_length = if info.is_directory {
            info.files.iter().map(|f| f.length).sum::<i64>()
        } else {
            info.length.unwrap_or(0)
        };
        let expected_num_pieces = if info.piece_length > 0 {
            ((total_length + info.piece_length - 1) / info.piece_length) as usize
        } else {
            0
        };
        if expected_num_pieces != pieces_hash.len() {
            return Err(TorrentError::PieceCountMismatch {
                expected: expected_num_pieces,
                actual: pieces_hash.len(),
            });
        }

        Ok(TorrentFile {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            encoding,
            info,
            info_hash,
            pieces_hash,
        })
    }

    /// Reads and parses a `.torrent` file from disk.
    #[tracing::instrument(level = "debug")]
    pub fn parse_file(path: &Path) -> TorrentResult<TorrentFile> {
        let bytes = std::fs::read(path)?;
        let value = bencode::decoder::decode(&bytes)?;
        TorrentFile::parse(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn dict(pairs: Vec<(&[u8], BencodeValue)>) -> BencodeValue {
        let mut d = HashMap::new();
        for (k, v) in pairs {
            d.insert(k.to_vec(), v);
        }
        BencodeValue::Dict(d)
    }

    fn string(s: &str) -> BencodeValue {
        BencodeValue::String(s.as_bytes().to_vec())
    }

    fn multi_file_torrent(num_pieces: usize) -> BencodeValue {
        let files = BencodeValue::List(vec![
            dict(vec![(b"length", BencodeValue::Integer(12)), (b"path", BencodeValue::List(vec![string("file1")]))]),
            dict(vec![(b"length", BencodeValue::Integer(4)), (b"path", BencodeValue::List(vec![string("file2")]))]),
            dict(vec![(b"length", BencodeValue::Integer(7)), (b"path", BencodeValue::List(vec![string("file3")]))]),
        ]);
        let pieces = vec![0u8; num_pieces * 20];
        let info = dict(vec![
            (b"name", string("bundle")),
            (b"piece length", BencodeValue::Integer(10)),
            (b"pieces", BencodeValue::String(pieces)),
            (b"files", files),
        ]);
        dict(vec![(b"announce", string("http://tracker.example/announce")), (b"info", info)])
    }

    #[test]
    fn multi_file_total_length_sums_file_lengths() {
        let torrent = TorrentFile::parse(multi_file_torrent(3)).unwrap();
        assert_eq!(torrent.total_length(), 23);
        assert_eq!(torrent.num_pieces(), 3);
    }

    #[test]
    fn piece_size_law_only_last_piece_is_short() {
        let torrent = TorrentFile::parse(multi_file_torrent(3)).unwrap();
        let sizes: Vec<i64> = (0..torrent.num_pieces()).map(|i| torrent.piece_size(i)).collect();
        assert_eq!(sizes, vec![10, 10, 3]);
        assert_eq!(sizes.iter().sum::<i64>(), torrent.total_length());
        for (i, size) in sizes.iter().enumerate() {
            if i < sizes.len() - 1 {
                assert_eq!(*size, torrent.info.piece_length);
            } else {
                assert!(*size <= torrent.info.piece_length);
            }
        }
    }

    #[test]
    fn rejects_piece_count_mismatch() {
        let err = TorrentFile::parse(multi_file_torrent(2)).unwrap_err();
        assert!(matches!(err, TorrentError::PieceCountMismatch { expected: 3, actual: 2 }));
    }

    #[test]
    fn rejects_info_with_both_length_and_files() {
        let one_file = BencodeValue::List(vec![dict(vec![
            (b"length", BencodeValue::Integer(10)),
            (b"path", BencodeValue::List(vec![string("only")])),
        ])]);
        let info = dict(vec![
            (b"name", string("bundle")),
            (b"piece length", BencodeValue::Integer(10)),
            (b"pieces", BencodeValue::String(vec![0u8; 20])),
            (b"length", BencodeValue::Integer(10)),
            (b"files", one_file),
        ]);
        let torrent_value =
            dict(vec![(b"announce", string("http://tracker.example/announce")), (b"info", info)]);
        assert!(TorrentFile::parse(torrent_value).is_err());
    }

    #[test]
    fn info_hash_is_stable_across_reparses() {
        let a = TorrentFile::parse(multi_file_torrent(3)).unwrap();
        let b = TorrentFile::parse(multi_file_torrent(3)).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }
}
