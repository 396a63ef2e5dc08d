use bytes::Bytes;

use super::media::*;
use super::metadata::{Cluster, MediaMetadata};
use super::part::PartStatus;
use crate::origin::ByteRange;

fn metadata(size: u64, offsets: &[u64]) -> MediaMetadata {
    MediaMetadata {
        size,
        duration: offsets.len() as f64,
        clusters: offsets
            .iter()
            .enumerate()
            .map(|(i, offset)| Cluster {
                offset: *offset,
                timecode: i as f64,
            })
            .collect(),
    }
}

fn media_with_parts(n: u64) -> Media {
    let mut media = Media::new("http://o/v.webm", "http://o/v.json");
    let offsets: Vec<u64> = (0..n).map(|i| 10 + i * 10).collect();
    media.init_parts(metadata(10 + n * 10, &offsets));
    media
}

#[test]
fn test_metadata_ranges() {
    let md = metadata(90, &[30, 50, 70]);
    assert_eq!(md.part_count(), 3);
    assert_eq!(md.head_range(), Some(ByteRange::new(0, 29)));
    assert_eq!(md.part_range(0), Some(ByteRange::new(30, 49)));
    assert_eq!(md.part_range(1), Some(ByteRange::new(50, 69)));
    assert_eq!(md.part_range(2), Some(ByteRange::new(70, 89)), "last runs to size - 1");
    assert_eq!(md.part_range(3), None);

    let headless = metadata(20, &[0, 10]);
    assert_eq!(headless.head_range(), None);
}

#[test]
fn test_peer_has_part() {
    let mut media = media_with_parts(10);
    for n in [0usize, 3, 4, 7] {
        media.parts[n].accept_whole(Bytes::from_static(b"x"));
        media.parts[n].status = PartStatus::Added;
    }

    for n in 0..10i64 {
        let expected = matches!(n, 0 | 3 | 4 | 7);
        assert_eq!(media.peer_has_part(n), expected, "part {}", n);
    }
    assert!(!media.peer_has_part(-1));
    assert!(!media.peer_has_part(10));
}

#[test]
fn test_remote_has_part() {
    let mut media = media_with_parts(5);
    media.remotes.insert("2".to_owned(), vec![0, 2, 4]);
    media.remotes.insert("5".to_owned(), vec![1, 2]);

    for (remote, part) in [("2", 0), ("2", 2), ("2", 4), ("5", 1), ("5", 2)] {
        assert!(media.remote_has_part(remote, part), "({}, {})", remote, part);
    }
    for (remote, part) in [("3", 0), ("2", 1), ("5", 3)] {
        assert!(!media.remote_has_part(remote, part), "({}, {})", remote, part);
    }
}

#[test]
fn test_next_parts_all_from_single_holder() {
    let mut media = media_with_parts(5);
    media
        .remotes
        .insert("1".to_owned(), vec![0, 1, 2, 3, 4]);

    let picked = media.next_parts_to_download(3);

    assert_eq!(picked.len(), 3);
    for (i, (source, part)) in picked.iter().enumerate() {
        assert_eq!(*part, i as u32, "parts come in order");
        assert_eq!(*source, PartSource::Remote("1".to_owned()));
        assert_eq!(media.parts[i].status, PartStatus::Pending);
    }
    assert_eq!(media.parts[3].status, PartStatus::Needed);
}

#[test]
fn test_next_parts_origin_when_nobody_has_it() {
    let mut media = media_with_parts(2);
    media.remotes.insert("1".to_owned(), vec![1]);

    let picked = media.next_parts_to_download(2);
    assert_eq!(
        picked,
        vec![
            (PartSource::Origin, 0),
            (PartSource::Remote("1".to_owned()), 1),
        ]
    );
}

#[test]
fn test_next_parts_skips_non_needed() {
    let mut media = media_with_parts(4);
    media.parts[0].status = PartStatus::Added;
    media.parts[1].status = PartStatus::Pending;

    let picked = media.next_parts_to_download(10);
    let numbers: Vec<u32> = picked.iter().map(|(_, n)| *n).collect();
    assert_eq!(numbers, vec![2, 3]);
}

#[test]
fn test_take_lowest_available_in_order() {
    let mut media = media_with_parts(4);
    media.parts[2].accept_whole(Bytes::from_static(b"two"));
    media.parts[0].accept_whole(Bytes::from_static(b"zero"));

    let (first, bytes) = media.take_lowest_available().unwrap();
    assert_eq!(first, 0);
    assert_eq!(bytes, Bytes::from_static(b"zero"));
    assert_eq!(media.parts[0].status, PartStatus::Added);
    assert!(media.parts[0].has_bytes(), "bytes stay for serving");

    let (second, _) = media.take_lowest_available().unwrap();
    assert_eq!(second, 2);
    assert!(media.take_lowest_available().is_none());
}

#[test]
fn test_all_added_and_held_parts() {
    let mut media = media_with_parts(2);
    assert!(!media.all_added());

    media.parts[0].accept_whole(Bytes::from_static(b"a"));
    media.parts[1].accept_whole(Bytes::from_static(b"b"));
    assert_eq!(media.held_parts(), vec![0, 1]);
    assert!(!media.all_added());

    while media.take_lowest_available().is_some() {}
    assert!(media.all_added());
}
