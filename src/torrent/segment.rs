//! Piece-to-file segmentation: mapping a piece's byte range onto the
//! ordered stream of files a multi-file torrent declares, and writing the
//! resulting segments back to disk once a piece has verified.
use super::file::InfoDict;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// The portion of a piece that lands in a single target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub path: Vec<String>,
    pub offset: u64,
    pub length: u64,
}

/// Returns the ordered segments covering the byte range of piece `index`,
/// projected onto the concatenated file stream (declaration order for
/// multi-file torrents, a single segment for single-file ones).
///
/// Walks the files in declared order tracking a running offset `r`; for
/// each file of length `l`, if the piece hasn't reached it yet (`r + l <=
/// piece_start`) skip it, otherwise emit the overlap and advance both the
/// piece cursor and `r`. Zero-length files never overlap anything and are
/// skipped without emitting an empty segment.
pub fn segments_for_piece(info: &InfoDict, index: usize, piece_length: i64) -> Vec<Segment> {
    let piece_size = piece_size_of(info, index, piece_length);
    if piece_size == 0 {
        return Vec::new();
    }
    let mut piece_start = (index as i64) * piece_length;
    let mut piece_remaining = piece_size;

    if !info.is_directory {
        return vec![Segment {
            path: vec![info.name.clone()],
            offset: piece_start as u64,
            length: piece_size as u64,
        }];
    }

    let mut segments = Vec::new();
    let mut r: i64 = 0;
    for file in &info.files {
        if file.length == 0 {
            continue;
        }
        if piece_remaining == 0 {
            break;
        }
        if r + file.length <= piece_start {
            r += file.length;
            continue;
        }
        let seg_len = std::cmp::min(r + file.length - piece_start, piece_remaining);
        let mut path = vec![info.name.clone()];
        path.extend(file.path.clone());
        segments.push(Segment {
            path,
            offset: (piece_start - r) as u64,
            length: seg_len as u64,
        });
        piece_start += seg_len;
        piece_remaining -= seg_len;
        r += file.length;
    }
    segments
}

fn piece_size_of(info: &InfoDict, index: usize, piece_length: i64) -> i64 {
    let total_length = if info.is_directory {
        info.files.iter().map(|f| f.length).sum::<i64>()
    } else {
        info.length.unwrap_or(0)
    };
    let num_pieces = if piece_length > 0 {
        ((total_length + piece_length - 1) / piece_length) as usize
    } else {
        0
    };
    if index >= num_pieces {
        return 0;
    }
    if index < num_pieces - 1 {
        piece_length
    } else {
        let remainder = total_length - (num_pieces - 1) as i64 * piece_length;
        if remainder == 0 {
            piece_length
        } else {
            remainder
        }
    }
}

/// Writes a verified piece buffer out to its segments under `base_dir`,
/// creating parent directories and target files as needed.
pub fn write_segments(base_dir: &Path, segments: &[Segment], buffer: &[u8]) -> std::io::Result<()> {
    let mut cursor = 0usize;
    for segment in segments {
        let mut full_path: PathBuf = base_dir.to_path_buf();
        for component in &segment.path {
            full_path = full_path.join(component);
        }
        if let Some(parent) = full_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&full_path)?;
        file.seek(SeekFrom::Start(segment.offset))?;
        let end = cursor + segment.length as usize;
        file.write_all(&buffer[cursor..end])?;
        cursor = end;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::file::FileDict;

    fn multi_file_info() -> InfoDict {
        InfoDict {
            piece_length: 10,
            pieces: Vec::new(),
            private: false,
            name: "bundle".to_string(),
            length: None,
            files: vec![
                FileDict { length: 12, path: vec!["file1".to_string()] },
                FileDict { length: 4, path: vec!["file2".to_string()] },
                FileDict { length: 7, path: vec!["file3".to_string()] },
            ],
            is_directory: true,
        }
    }

    #[test]
    fn piece_zero_is_entirely_in_file1() {
        let info = multi_file_info();
        let segs = segments_for_piece(&info, 0, 10);
        assert_eq!(segs, vec![Segment { path: vec!["bundle".into(), "file1".into()], offset: 0, length: 10 }]);
    }

    #[test]
    fn piece_one_straddles_three_files() {
        let info = multi_file_info();
        let segs = segments_for_piece(&info, 1, 10);
        assert_eq!(
            segs,
            vec![
                Segment { path: vec!["bundle".into(), "file1".into()], offset: 10, length: 2 },
                Segment { path: vec!["bundle".into(), "file2".into()], offset: 0, length: 4 },
                Segment { path: vec!["bundle".into(), "file3".into()], offset: 0, length: 4 },
            ]
        );
    }

    #[test]
    fn last_piece_is_short() {
        let info = multi_file_info();
        let segs = segments_for_piece(&info, 2, 10);
        assert_eq!(segs, vec![Segment { path: vec!["bundle".into(), "file3".into()], offset: 4, length: 3 }]);
    }

    #[test]
    fn zero_length_files_are_skipped() {
        let mut info = multi_file_info();
        info.files.insert(1, FileDict { length: 0, path: vec!["empty".to_string()] });
        let segs = segments_for_piece(&info, 1, 10);
        assert!(segs.iter().all(|s| s.path != vec!["bundle".to_string(), "empty".to_string()]));
    }

    #[test]
    fn segment_lengths_sum_to_piece_size() {
        let info = multi_file_info();
        for i in 0..3 {
            let segs = segments_for_piece(&info, i, 10);
            let total: u64 = segs.iter().map(|s| s.length).sum();
            assert_eq!(total as i64, piece_size_of(&info, i, 10));
        }
    }
}
