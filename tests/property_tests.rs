//! Property-based tests for manifest invariants
//!
//! Uses proptest to exercise the codec round-trip, the hash
//! multiplexer, and the create-then-verify/mutate-then-fail properties
//! across randomly generated trees.

use mantree::entry::{FileRef, ManifestEntry};
use mantree::hashing::{self, DigestMap};
use mantree::loader::{ManifestLoader, UpdateOptions, VerifyOptions};
use mantree::manifest::ManifestFile;
use mantree::MantreeError;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn hex_strategy() -> impl Strategy<Value = String> {
    "[0-9a-f]{64}"
}

fn rel_path_strategy() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9]{0,7}(/[a-z][a-z0-9]{0,7}){0,3}"
}

fn digests_strategy() -> impl Strategy<Value = DigestMap> {
    proptest::collection::btree_map(
        prop_oneof![
            Just("SHA256".to_string()),
            Just("SHA512".to_string()),
            Just("BLAKE2B".to_string()),
        ],
        hex_strategy(),
        1..=3,
    )
}

fn file_ref_strategy() -> impl Strategy<Value = FileRef> {
    (rel_path_strategy(), 0u64..1 << 40, digests_strategy()).prop_map(|(path, size, digests)| {
        FileRef {
            path,
            size,
            digests,
        }
    })
}

fn entry_strategy() -> impl Strategy<Value = ManifestEntry> {
    prop_oneof![
        file_ref_strategy().prop_map(ManifestEntry::Data),
        file_ref_strategy().prop_map(ManifestEntry::Misc),
        file_ref_strategy().prop_map(ManifestEntry::Ebuild),
        file_ref_strategy().prop_map(ManifestEntry::Manifest),
        file_ref_strategy().prop_map(|mut f| {
            f.path = format!("files/{}", f.path);
            ManifestEntry::Aux(f)
        }),
        ("[a-z][a-z0-9._-]{0,15}", 0u64..1 << 40, digests_strategy()).prop_map(
            |(name, size, digests)| {
                ManifestEntry::Dist(FileRef {
                    path: name,
                    size,
                    digests,
                })
            }
        ),
        rel_path_strategy().prop_map(|path| ManifestEntry::Ignore { path }),
        rel_path_strategy().prop_map(|path| ManifestEntry::Optional { path }),
    ]
}

fn manifest_strategy() -> impl Strategy<Value = ManifestFile> {
    (
        proptest::option::of(0i64..=4_102_444_800i64),
        proptest::collection::vec(entry_strategy(), 0..24),
    )
        .prop_map(|(timestamp, entries)| {
            let mut manifest = ManifestFile::new();
            if let Some(secs) = timestamp {
                manifest.entries.push(ManifestEntry::Timestamp(
                    chrono::DateTime::from_timestamp(secs, 0).expect("in range"),
                ));
            }
            manifest.entries.extend(entries);
            manifest
        })
}

proptest! {
    // parse(dump(M)) == M, entry order preserved, digests identical
    #[test]
    fn roundtrip_preserves_manifest(manifest in manifest_strategy()) {
        let text = manifest.dump();
        let reparsed = ManifestFile::parse(&text, Path::new("Manifest"), None).unwrap();
        prop_assert_eq!(&reparsed.entries, &manifest.entries);
        // a second trip is byte-stable
        prop_assert_eq!(reparsed.dump(), text);
    }

    // multiplexed hashing equals hashing each algorithm separately
    #[test]
    fn multiplexer_matches_single_hashes(data in proptest::collection::vec(any::<u8>(), 0..8192)) {
        let names = vec![
            "SHA256".to_string(),
            "SHA512".to_string(),
            "BLAKE2B".to_string(),
        ];
        let multi = hashing::hash_reader(&data[..], &names).unwrap();
        prop_assert_eq!(multi.size, data.len() as u64);
        for name in &names {
            let single = hashing::hash_bytes(&data, name).unwrap();
            prop_assert_eq!(&multi.digests[name], &single);
        }
    }

    // escaping is reversible for arbitrary printable path bytes
    #[test]
    fn path_escape_roundtrip(path in "[ -~]{1,40}") {
        let escaped = mantree::pathutil::escape(&path);
        prop_assert!(!escaped.contains(' '));
        prop_assert_eq!(mantree::pathutil::unescape(&escaped).unwrap(), path);
    }
}

// filesystem-backed properties run fewer cases
proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    // create(T) then verify(T) succeeds
    #[test]
    fn creation_implies_verification(tree in tree_strategy()) {
        let dir = TempDir::new().unwrap();
        write_tree(dir.path(), &tree);

        let mut creator = ManifestLoader::builder()
            .verify_openpgp(false)
            .allow_create(true)
            .hashes(vec!["SHA256".to_string()])
            .build(&dir.path().join("Manifest"))
            .unwrap();
        creator
            .update_entries_for_directory("", &UpdateOptions::default())
            .unwrap();
        creator.save_manifests(false).unwrap();

        let mut verifier = ManifestLoader::builder()
            .verify_openpgp(false)
            .build(&dir.path().join("Manifest"))
            .unwrap();
        verifier
            .assert_directory_verifies("", &VerifyOptions::default())
            .unwrap();
    }

    // flipping one byte of one covered file fails verification with a
    // mismatch for that path and no other
    #[test]
    fn mutation_implies_single_failure(
        tree in tree_strategy(),
        victim_index in any::<prop::sample::Index>(),
    ) {
        let dir = TempDir::new().unwrap();
        write_tree(dir.path(), &tree);

        let mut creator = ManifestLoader::builder()
            .verify_openpgp(false)
            .allow_create(true)
            .hashes(vec!["SHA256".to_string()])
            .build(&dir.path().join("Manifest"))
            .unwrap();
        creator
            .update_entries_for_directory("", &UpdateOptions::default())
            .unwrap();
        creator.save_manifests(false).unwrap();

        // flip one byte, keeping the length
        let paths: Vec<&String> = tree.keys().collect();
        let victim = paths[victim_index.index(paths.len())].clone();
        let mut content = tree[&victim].clone();
        let flip = content.len() / 2;
        content[flip] ^= 0xff;
        fs::write(dir.path().join(&victim), &content).unwrap();

        let mut verifier = ManifestLoader::builder()
            .verify_openpgp(false)
            .build(&dir.path().join("Manifest"))
            .unwrap();
        let err = verifier
            .assert_directory_verifies("", &VerifyOptions::default())
            .unwrap_err();
        match err {
            MantreeError::VerificationFailed { failures } => {
                prop_assert_eq!(failures.len(), 1);
                match &failures[0] {
                    MantreeError::HashMismatch { path, algo, .. } => {
                        prop_assert_eq!(path, &victim);
                        prop_assert_eq!(algo.as_str(), "SHA256");
                    }
                    other => prop_assert!(false, "expected HashMismatch, got {:?}", other),
                }
            }
            other => prop_assert!(false, "expected aggregate, got {:?}", other),
        }
    }
}

// Random trees: files in per-index directories so paths never collide,
// contents non-empty so a byte can be flipped in place.
fn tree_strategy() -> impl Strategy<Value = BTreeMap<String, Vec<u8>>> {
    proptest::collection::vec(
        ("[a-z]{1,8}\\.(txt|rs|md)", proptest::collection::vec(any::<u8>(), 1..512)),
        1..8,
    )
    .prop_map(|files| {
        files
            .into_iter()
            .enumerate()
            .map(|(i, (name, content))| (format!("d{}/{}", i, name), content))
            .collect()
    })
}

fn write_tree(root: &Path, tree: &BTreeMap<String, Vec<u8>>) {
    for (path, content) in tree {
        let full = root.join(path);
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, content).unwrap();
    }
}
