mod util;

use quadforest::api;
use quadforest::io::format::{CONNECTIVITY_PREFIX_LEN, FOREST_HEADER_LEN, record_len};
use quadforest::io::{LoadOptions, WritePolicy, load_forest_ext, save_forest_with};
use quadforest::prelude::*;
use std::fs;
use std::path::Path;
use quadforest::algs::collective::tags;
use util::{assert_balanced, assert_sorted, coin, concat, run_garbled, run_ranks};

fn save_refined<const D: usize>(
    size: usize,
    name: &str,
    path: &Path,
    policy: WritePolicy,
) -> Vec<Quadrant<D>> {
    let conn = api::build_connectivity::<D>(name).unwrap();
    let per_rank = run_ranks(size, |c| {
        let mut f = api::new_forest(c, &conn, 1).unwrap();
        f.refine_recursive(4, |q| coin(q, 21));
        partition(&mut f, c, None).unwrap();
        save_forest_with(c, path, &f, policy).unwrap();
        f.local_quadrants().to_vec()
    });
    concat(&per_rank)
}

#[test]
fn star_connectivity_survives_a_different_rank_count() {
    let dir = tempfile::tempdir().unwrap();
    let conn_path = dir.path().join("star.conn");
    let forest_path = dir.path().join("star.forest");
    let conn = api::build_connectivity::<2>("star").unwrap();

    let saved = run_ranks(3, |c| {
        let mut f = api::new_forest(c, &conn, 2).unwrap();
        f.refine(|q| q.tree % 2 == 1 && q.child_id() == 0);
        if c.rank() == 0 {
            api::save_connectivity(&conn_path, &conn).unwrap();
        }
        api::save_forest(c, &forest_path, &f).unwrap();
        f.local_quadrants().to_vec()
    });

    let bytes = fs::read(&forest_path).unwrap();
    let at = FOREST_HEADER_LEN + 12;
    let num_trees = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
    assert_eq!(num_trees, 5);

    let loaded = run_ranks(2, |c| {
        let (from_forest, f) = api::load_forest::<_, 2>(c, &forest_path).unwrap();
        let standalone = api::load_connectivity::<2>(&conn_path).unwrap();
        assert!(api::connectivity_equal(&from_forest, &conn));
        assert!(api::connectivity_equal(&standalone, &conn));
        assert!(api::connectivity_equal(&conn, &standalone));
        assert_eq!(standalone.num_trees(), 5);
        f.local_quadrants().to_vec()
    });
    assert_balanced(&loaded.iter().map(Vec::len).collect::<Vec<_>>());
    assert_eq!(concat(&saved), concat(&loaded));
}

#[test]
fn save_on_n_ranks_load_on_m_ranks() {
    let dir = tempfile::tempdir().unwrap();
    for (n, m) in [(1, 3), (3, 1), (2, 4), (4, 4), (5, 2)] {
        let path = dir.path().join(format!("periodic_{n}_{m}.forest"));
        let saved = save_refined::<3>(n, "periodic", &path, WritePolicy::ParallelOffsets);
        let loaded = run_ranks(m, |c| {
            let (_, f) = api::load_forest::<_, 3>(c, &path).unwrap();
            assert!(f.is_valid(c).unwrap());
            assert!(f.is_synchronized());
            assert_eq!(f.global_count(), saved.len() as u64);
            f.local_quadrants().to_vec()
        });
        assert_balanced(&loaded.iter().map(Vec::len).collect::<Vec<_>>());
        assert_eq!(concat(&loaded), saved, "{n} -> {m}");
    }
}

#[test]
fn both_write_policies_produce_the_same_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let parallel = dir.path().join("parallel.forest");
    let gathered = dir.path().join("gathered.forest");
    let a = save_refined::<2>(3, "ring", &parallel, WritePolicy::ParallelOffsets);
    let b = save_refined::<2>(3, "ring", &gathered, WritePolicy::GatherToRoot);
    assert_eq!(a, b);
    assert_eq!(fs::read(&parallel).unwrap(), fs::read(&gathered).unwrap());
    assert!(!dir.path().join("parallel.forest.partial").exists());
}

#[test]
fn file_size_matches_the_layout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unit.forest");
    let conn = api::build_connectivity::<2>("unit").unwrap();
    run_ranks(2, |c| {
        let f = api::new_forest(c, &conn, 2).unwrap();
        api::save_forest(c, &path, &f).unwrap();
    });
    // one tree: 4 vertices, 4 neighbor trees and faces, 4 vertex positions
    let conn_len = CONNECTIVITY_PREFIX_LEN + 4 * 4 + 4 * 4 + 4 + 4 * 24;
    let expected = FOREST_HEADER_LEN + conn_len + 3 * 8 + 16 * record_len(2);
    assert_eq!(fs::metadata(&path).unwrap().len(), expected as u64);
}

#[test]
fn saved_partition_is_kept_without_autopartition() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("skewed.forest");
    let conn = api::build_connectivity::<2>("periodic").unwrap();
    let out = run_ranks(3, |c| {
        let mut f = api::new_forest(c, &conn, 2).unwrap();
        partition(&mut f, c, Some(&[10, 0, 6])).unwrap();
        api::save_forest(c, &path, &f).unwrap();

        let keep = LoadOptions {
            autopartition: false,
        };
        let kept = load_forest_ext::<_, 2>(c, &path, keep).unwrap();
        assert!(api::forest_equal(c, &f, &kept).unwrap());

        let spread = load_forest_ext::<_, 2>(c, &path, LoadOptions::default()).unwrap();
        assert!(!api::forest_equal(c, &f, &spread).unwrap());
        assert!(f.same_global_sequence(&spread, c).unwrap());
        (kept.local_count(), spread.local_count())
    });
    assert_eq!(out, vec![(10, 6), (0, 5), (6, 5)]);

    // a different rank count always spreads evenly
    let counts = run_ranks(2, |c| {
        let keep = LoadOptions {
            autopartition: false,
        };
        load_forest_ext::<_, 2>(c, &path, keep).unwrap().local_count()
    });
    assert_eq!(counts, vec![8, 8]);
}

#[test]
fn uniform_levels_round_trip_through_rank_counts() {
    let dir = tempfile::tempdir().unwrap();
    let conn = api::build_connectivity::<3>("twocubes").unwrap();
    for level in 0..3u8 {
        let path = dir.path().join(format!("level{level}.forest"));
        run_ranks(4, |c| {
            let f = api::new_forest(c, &conn, level).unwrap();
            api::save_forest(c, &path, &f).unwrap();
        });
        let loaded = run_ranks(3, |c| {
            let (_, f) = api::load_forest::<_, 3>(c, &path).unwrap();
            f.local_quadrants().to_vec()
        });
        let all = concat(&loaded);
        assert_eq!(all.len(), 2 << (3 * level));
        assert_sorted(&all);
        assert!(all.iter().all(|q| q.level == level));
    }
}

fn saved_unit_file(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("victim.forest");
    let conn = api::build_connectivity::<2>("unit").unwrap();
    let f = api::new_forest(&NoComm, &conn, 2).unwrap();
    api::save_forest(&NoComm, &path, &f).unwrap();
    path
}

fn load_on_two_ranks(path: &Path) -> ForestError {
    let errs = run_ranks(2, |c| api::load_forest::<_, 2>(c, path).unwrap_err());
    assert_eq!(errs[0], errs[1]);
    errs[0].clone()
}

#[test]
fn corrupt_magic_is_reported_on_every_rank() {
    let dir = tempfile::tempdir().unwrap();
    let path = saved_unit_file(dir.path());
    let mut bytes = fs::read(&path).unwrap();
    bytes[0] ^= 0xff;
    fs::write(&path, &bytes).unwrap();
    assert!(matches!(load_on_two_ranks(&path), ForestError::CorruptHeader(_)));
}

#[test]
fn unknown_revision_and_wrong_dimension_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = saved_unit_file(dir.path());
    let mut bytes = fs::read(&path).unwrap();
    bytes[8..12].copy_from_slice(&((2u32 << 24) | 9).to_le_bytes());
    fs::write(&path, &bytes).unwrap();
    assert_eq!(
        load_on_two_ranks(&path),
        ForestError::FormatVersionMismatch {
            found: 9,
            supported: 1
        }
    );

    let path = saved_unit_file(dir.path());
    let errs = run_ranks(2, |c| api::load_forest::<_, 3>(c, &path).unwrap_err());
    assert_eq!(
        errs[1],
        ForestError::DimensionMismatch {
            expected: 3,
            found: 2
        }
    );
}

#[test]
fn truncated_and_padded_files_are_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = saved_unit_file(dir.path());
    let bytes = fs::read(&path).unwrap();
    for len in [4, FOREST_HEADER_LEN + 6, bytes.len() - 5] {
        fs::write(&path, &bytes[..len]).unwrap();
        assert!(
            matches!(load_on_two_ranks(&path), ForestError::CorruptHeader(_)),
            "length {len}"
        );
    }
    let mut padded = bytes.clone();
    padded.extend_from_slice(&[0; 3]);
    fs::write(&path, &padded).unwrap();
    assert!(matches!(load_on_two_ranks(&path), ForestError::CorruptHeader(_)));
}

#[test]
fn forged_rank_count_is_rejected_before_reading_the_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = saved_unit_file(dir.path());
    let mut bytes = fs::read(&path).unwrap();
    for forged in [u32::MAX, 1 << 20] {
        bytes[28..32].copy_from_slice(&forged.to_le_bytes());
        fs::write(&path, &bytes).unwrap();
        let err = load_on_two_ranks(&path);
        assert!(matches!(err, ForestError::CorruptHeader(_)), "{forged}: {err:?}");
    }
}

#[test]
fn unsorted_records_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    let path = saved_unit_file(dir.path());
    let mut bytes = fs::read(&path).unwrap();
    let rec = record_len(2);
    let first = bytes.len() - 16 * rec;
    let (a, b) = (first, first + rec);
    let head: Vec<u8> = bytes[a..b].to_vec();
    bytes.copy_within(b..b + rec, a);
    bytes[b..b + rec].copy_from_slice(&head);
    fs::write(&path, &bytes).unwrap();
    assert!(matches!(load_on_two_ranks(&path), ForestError::InvalidForest(_)));
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_on_two_ranks(&dir.path().join("absent.forest"));
    assert!(matches!(err, ForestError::Io(_)));
}

#[test]
fn failure_on_one_rank_fails_the_save_everywhere() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("out.forest");
    let unreachable = dir.path().join("no_such_dir").join("out.forest");
    let conn = api::build_connectivity::<2>("unit").unwrap();
    let errs = run_ranks(2, |c| {
        let f = api::new_forest(c, &conn, 2).unwrap();
        let path = if c.rank() == 1 { &unreachable } else { &good };
        api::save_forest(c, path, &f).unwrap_err()
    });
    assert_eq!(errs[0], errs[1]);
    assert!(matches!(errs[0], ForestError::Io(_)));
    assert!(!good.exists());
    assert!(!dir.path().join("out.forest.partial").exists());
}

#[test]
fn existing_file_survives_a_failed_save() {
    let dir = tempfile::tempdir().unwrap();
    let path = saved_unit_file(dir.path());
    let before = fs::read(&path).unwrap();
    let conn = api::build_connectivity::<2>("unit").unwrap();
    let elsewhere = dir.path().join("missing").join("victim.forest");
    run_ranks(2, |c| {
        let f = api::new_forest(c, &conn, 3).unwrap();
        let target = if c.rank() == 0 { path.as_path() } else { elsewhere.as_path() };
        assert!(api::save_forest(c, target, &f).is_err());
    });
    assert_eq!(fs::read(&path).unwrap(), before);
}

#[test]
fn transport_failure_while_assembling_is_agreed() {
    let dir = tempfile::tempdir().unwrap();
    let path = saved_unit_file(dir.path());
    let errs = run_garbled(2, tags::SIZES, |c| {
        api::load_forest::<_, 2>(c, &path).map(|_| ()).unwrap_err()
    });
    assert_eq!(errs[0], errs[1]);
    assert!(matches!(errs[0], ForestError::CommError { neighbor: 0, .. }));
}
