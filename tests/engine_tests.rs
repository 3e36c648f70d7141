//! End-to-end tests: backup, restore, verify and cleanup against real trees
//! in temporary directories.

use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use casnap::codec::{hash_path, hex_encode};
use casnap::engine::{backup, cleanup, hash_bytes, restore, verify};
use casnap::exclude::Exclusions;
use casnap::fs::Filesystem;
use casnap::fs::local::LocalFilesystem;
use casnap::index::parse_record;
use casnap::{Context, Opts, Stats};

fn context(repo: &Path, index: Option<&Path>, root: Option<&Path>) -> Context {
    Context {
        opts: Opts {
            repo: Some(repo.to_path_buf()),
            index: index.map(Path::to_path_buf),
            root: root.map(Path::to_path_buf),
            ..Opts::default()
        },
        stats: Stats::default(),
        exclusions: Exclusions::default(),
        host_fs: Box::new(LocalFilesystem),
        backup_fs: Box::new(LocalFilesystem),
        cancel: Arc::new(AtomicBool::new(false)),
    }
}

fn run_backup(repo: &Path, index: &Path, root: &Path) -> Context {
    let mut ctx = context(repo, Some(index), Some(root));
    backup::do_backup(&mut ctx).unwrap();
    ctx
}

fn blob_path(repo: &Path, content: &[u8]) -> PathBuf {
    repo.join("sha1").join(hash_path(&hash_bytes(content)))
}

/// Timestamps in the future keep atimes stable across backup reads.
fn future_time() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    now + 86_400
}

fn set_times(path: &Path, t: i64) {
    LocalFilesystem.utimes(path, t, t).unwrap();
}

/// Decoded `name` of every record in an index, in file order.
fn index_names(index: &Path) -> Vec<String> {
    let text = std::fs::read_to_string(index).unwrap();
    text.lines()
        .take_while(|l| *l != "[end]")
        .map(|l| {
            let rec = parse_record(l).unwrap();
            String::from_utf8(rec.get("name").unwrap().clone()).unwrap()
        })
        .collect()
}

fn tmp_files_under(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(d) = stack.pop() {
        for entry in std::fs::read_dir(&d).unwrap() {
            let entry = entry.unwrap();
            if entry.file_type().unwrap().is_dir() {
                stack.push(entry.path());
            } else if entry.file_name().to_string_lossy().ends_with(".tmp") {
                found.push(entry.path());
            }
        }
    }
    found
}

// --- backup: record shapes ---

#[test]
fn test_small_file_inline_record() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let greet = root.join("greet.txt");
    std::fs::write(&greet, b"hi").unwrap();
    std::fs::set_permissions(&greet, std::fs::Permissions::from_mode(0o644)).unwrap();
    let repo = t.path().join("repo");
    let index = t.path().join("index");

    let ctx = run_backup(&repo, &index, &root);

    let text = std::fs::read_to_string(&index).unwrap();
    assert!(text.ends_with("[end]\n"));
    let first = text.lines().next().unwrap();
    let keys: Vec<&str> = first
        .split('&')
        .map(|kv| kv.split('=').next().unwrap())
        .collect();
    assert_eq!(
        keys,
        ["name", "perms", "uid", "gid", "atime", "ctime", "mtime", "data"]
    );
    assert!(first.starts_with("name=greet.txt&perms=0644&uid="));
    assert!(first.ends_with("&data=hi"));
    assert_eq!(ctx.stats.small_files, 1);
    assert_eq!(ctx.stats.regular_files, 1);
    // Nothing was large enough to reach the blob store.
    assert!(!repo.join("sha1").exists());
}

#[test]
fn test_zero_byte_file_is_inline() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("empty"), b"").unwrap();
    let index = t.path().join("index");

    run_backup(&t.path().join("repo"), &index, &root);

    let text = std::fs::read_to_string(&index).unwrap();
    assert!(text.lines().next().unwrap().ends_with("&data="));
}

#[test]
fn test_store_limit_boundary() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let at_limit = vec![b'a'; 256];
    let over_limit = vec![b'b'; 257];
    std::fs::write(root.join("at"), &at_limit).unwrap();
    std::fs::write(root.join("over"), &over_limit).unwrap();
    let repo = t.path().join("repo");
    let index = t.path().join("index");

    let ctx = run_backup(&repo, &index, &root);

    let text = std::fs::read_to_string(&index).unwrap();
    let at_line = text.lines().find(|l| l.starts_with("name=at")).unwrap();
    let over_line = text.lines().find(|l| l.contains("name=over")).unwrap();
    assert!(at_line.contains("&data="));
    assert!(!at_line.contains("&sha1="));
    assert!(over_line.contains(&format!("&sha1={}", hex_encode(&hash_bytes(&over_limit)))));
    assert!(!over_line.contains("&data="));

    let blob = blob_path(&repo, &over_limit);
    assert_eq!(std::fs::read(&blob).unwrap(), over_limit);
    assert_eq!(ctx.stats.new_hashes, 1);
    assert!(tmp_files_under(&repo).is_empty());
}

#[test]
fn test_identical_content_shares_one_blob() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let content = vec![b'x'; 1000];
    std::fs::write(root.join("one"), &content).unwrap();
    std::fs::write(root.join("two"), &content).unwrap();
    let repo = t.path().join("repo");
    let index = t.path().join("index");

    let ctx = run_backup(&repo, &index, &root);

    assert_eq!(ctx.stats.new_hashes, 1);
    let hex = hex_encode(&hash_bytes(&content));
    let text = std::fs::read_to_string(&index).unwrap();
    assert_eq!(
        text.lines()
            .filter(|l| l.contains(&format!("&sha1={hex}")))
            .count(),
        2
    );
}

#[test]
fn test_large_file_hashed_via_mmap() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let content: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(root.join("big"), &content).unwrap();
    let repo = t.path().join("repo");
    let index = t.path().join("index");

    let ctx = run_backup(&repo, &index, &root);

    assert_eq!(ctx.stats.hash_mmap, 1);
    assert_eq!(ctx.stats.hash_read, 0);
    let text = std::fs::read_to_string(&index).unwrap();
    assert!(text.contains(&format!("&sha1={}", hex_encode(&hash_bytes(&content)))));
    assert_eq!(std::fs::read(blob_path(&repo, &content)).unwrap(), content);
}

// --- backup: naming and ordering ---

#[test]
fn test_relative_names_and_directory_ordering() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir_all(root.join("a_dir")).unwrap();
    std::fs::create_dir_all(root.join("c_dir")).unwrap();
    std::fs::write(root.join("b_file"), b"b").unwrap();
    std::fs::write(root.join("a_dir/y"), b"y").unwrap();
    std::fs::write(root.join("a_dir/z"), b"z").unwrap();
    std::fs::write(root.join("c_dir/x"), b"x").unwrap();
    let index = t.path().join("index");

    run_backup(&t.path().join("repo"), &index, &root);

    // Sorted within a directory; subdirectory contents strictly after the
    // parent's siblings; ./ shortcut after the first record of a directory.
    assert_eq!(
        index_names(&index),
        ["a_dir", "b_file", "c_dir", "a_dir/y", "./z", "c_dir/x"]
    );
}

#[test]
fn test_index_is_deterministic() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir_all(root.join("sub")).unwrap();
    std::fs::write(root.join("small"), b"small").unwrap();
    std::fs::write(root.join("sub/large"), vec![b'q'; 2000]).unwrap();
    let when = future_time();
    set_times(&root.join("small"), when);
    set_times(&root.join("sub/large"), when);
    set_times(&root.join("sub"), when);

    let repo = t.path().join("repo");
    let index1 = t.path().join("index1");
    let index2 = t.path().join("index2");
    run_backup(&repo, &index1, &root);
    run_backup(&repo, &index2, &root);

    assert_eq!(
        std::fs::read(&index1).unwrap(),
        std::fs::read(&index2).unwrap()
    );
}

#[test]
fn test_exclusions_skip_paths() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("keep.txt"), b"k").unwrap();
    std::fs::write(root.join("skipme.txt"), b"s").unwrap();
    let index = t.path().join("index");

    let mut ctx = context(&t.path().join("repo"), Some(&index), Some(&root));
    ctx.exclusions.add("skipme").unwrap();
    backup::do_backup(&mut ctx).unwrap();

    assert_eq!(index_names(&index), ["keep.txt"]);
}

#[test]
fn test_backup_refuses_existing_index() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let index = t.path().join("index");
    std::fs::write(&index, b"stale").unwrap();

    let mut ctx = context(&t.path().join("repo"), Some(&index), Some(&root));
    assert!(backup::do_backup(&mut ctx).is_err());

    let mut ctx = context(&t.path().join("repo"), Some(&index), Some(&root));
    ctx.opts.overwrite_index = true;
    backup::do_backup(&mut ctx).unwrap();
    assert_eq!(std::fs::read(&index).unwrap(), b"[end]\n");
}

#[test]
fn test_unsupported_file_type_is_skipped_with_warning() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("normal"), b"n").unwrap();
    let fifo = std::ffi::CString::new(root.join("pipe").to_str().unwrap()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(fifo.as_ptr(), 0o644) }, 0);
    let index = t.path().join("index");

    let ctx = run_backup(&t.path().join("repo"), &index, &root);

    assert_eq!(ctx.stats.unknown_files, 1);
    assert_eq!(ctx.stats.warnings, 1);
    assert_eq!(ctx.stats.errors, 0);
    assert_eq!(index_names(&index), ["normal"]);
}

// --- hints ---

#[test]
fn test_hint_fast_path_skips_rehashing() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("large"), vec![b'h'; 5000]).unwrap();
    set_times(&root.join("large"), future_time());
    let repo = t.path().join("repo");
    let hints = t.path().join("hints");

    let mut ctx = context(&repo, Some(&t.path().join("index1")), Some(&root));
    ctx.opts.hints = Some(hints.clone());
    backup::do_backup(&mut ctx).unwrap();
    assert_eq!(ctx.stats.hash_read, 1);
    assert_eq!(ctx.stats.hints_used, 0);
    assert!(
        std::fs::read_to_string(&hints)
            .unwrap()
            .ends_with("[end]\n")
    );

    let mut ctx = context(&repo, Some(&t.path().join("index2")), Some(&root));
    ctx.opts.hints = Some(hints.clone());
    backup::do_backup(&mut ctx).unwrap();
    assert_eq!(ctx.stats.hints_used, 1);
    assert_eq!(ctx.stats.hash_read, 0);
    assert_eq!(ctx.stats.hash_mmap, 0);

    assert_eq!(
        std::fs::read(t.path().join("index1")).unwrap(),
        std::fs::read(t.path().join("index2")).unwrap()
    );
}

#[test]
fn test_stale_hint_is_ignored() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let large = root.join("large");
    std::fs::write(&large, vec![b'h'; 5000]).unwrap();
    let repo = t.path().join("repo");
    let hints = t.path().join("hints");

    let mut ctx = context(&repo, Some(&t.path().join("index1")), Some(&root));
    ctx.opts.hints = Some(hints.clone());
    backup::do_backup(&mut ctx).unwrap();

    // Same size, different mtime: the hint no longer applies.
    std::fs::write(&large, vec![b'i'; 5000]).unwrap();
    set_times(&large, future_time());

    let mut ctx = context(&repo, Some(&t.path().join("index2")), Some(&root));
    ctx.opts.hints = Some(hints.clone());
    backup::do_backup(&mut ctx).unwrap();
    assert_eq!(ctx.stats.hints_used, 0);
    assert_eq!(ctx.stats.hash_read, 1);
}

// --- restore ---

#[test]
fn test_restore_round_trip() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir_all(root.join("sub")).unwrap();

    std::fs::write(root.join("top.txt"), b"small contents").unwrap();
    std::fs::set_permissions(&root.join("top.txt"), std::fs::Permissions::from_mode(0o604))
        .unwrap();
    let big: Vec<u8> = (0..4096u32).map(|i| (i % 239) as u8).collect();
    std::fs::write(root.join("big.bin"), &big).unwrap();
    std::fs::write(root.join("sub/inner.txt"), b"inner").unwrap();
    std::os::unix::fs::symlink("weird&=%+ target", root.join("link")).unwrap();
    std::fs::write(root.join("hard1"), b"shared").unwrap();
    std::fs::hard_link(root.join("hard1"), root.join("hard2")).unwrap();
    std::fs::hard_link(root.join("hard1"), root.join("hard3")).unwrap();
    UnixListener::bind(root.join("sock")).unwrap();
    std::fs::set_permissions(&root.join("sub"), std::fs::Permissions::from_mode(0o750)).unwrap();

    let when = future_time();
    for name in ["top.txt", "big.bin", "sub/inner.txt", "hard1"] {
        set_times(&root.join(name), when);
    }
    set_times(&root.join("sub"), when + 7);

    let repo = t.path().join("repo");
    let index = t.path().join("index");
    run_backup(&repo, &index, &root);

    let root2 = t.path().join("root2");
    std::fs::create_dir(&root2).unwrap();
    let mut ctx = context(&repo, Some(&index), Some(&root2));
    restore::do_restore(&mut ctx).unwrap();
    assert_eq!(ctx.stats.errors, 0);
    assert_eq!(ctx.stats.hardlinks, 2);
    assert_eq!(ctx.stats.links, 1);
    assert_eq!(ctx.stats.dirs, 1);
    assert_eq!(ctx.stats.socks, 1);

    // Contents.
    assert_eq!(std::fs::read(root2.join("top.txt")).unwrap(), b"small contents");
    assert_eq!(std::fs::read(root2.join("big.bin")).unwrap(), big);
    assert_eq!(std::fs::read(root2.join("sub/inner.txt")).unwrap(), b"inner");

    // Permission bits.
    let mode = |p: &Path| std::fs::symlink_metadata(p).unwrap().mode() & 0o7777;
    assert_eq!(mode(&root2.join("top.txt")), 0o604);
    assert_eq!(mode(&root2.join("sub")), 0o750);

    // Symlink target round-trips byte for byte.
    assert_eq!(
        std::fs::read_link(root2.join("link")).unwrap().as_os_str(),
        "weird&=%+ target"
    );

    // Hard link group shares one inode.
    let ino = |p: &Path| std::fs::symlink_metadata(p).unwrap().ino();
    assert_eq!(ino(&root2.join("hard1")), ino(&root2.join("hard2")));
    assert_eq!(ino(&root2.join("hard1")), ino(&root2.join("hard3")));

    // Socket was re-created.
    assert!(
        std::fs::symlink_metadata(root2.join("sock"))
            .unwrap()
            .file_type()
            .is_socket()
    );

    // File times, and directory times fixed up after their contents.
    let mtime = |p: &Path| std::fs::symlink_metadata(p).unwrap().mtime();
    assert_eq!(mtime(&root2.join("top.txt")), when);
    assert_eq!(mtime(&root2.join("sub")), when + 7);
}

#[test]
fn test_restore_missing_hash_is_counted_not_fatal() {
    let t = tempfile::tempdir().unwrap();
    let index = t.path().join("index");
    std::fs::write(
        &index,
        b"name=ghost&perms=0644&uid=0&gid=0&atime=0&ctime=0&mtime=0\n[end]\n",
    )
    .unwrap();
    let root = t.path().join("root");
    std::fs::create_dir(&root).unwrap();

    let mut ctx = context(&t.path().join("repo"), Some(&index), Some(&root));
    restore::do_restore(&mut ctx).unwrap();
    assert_eq!(ctx.stats.errors, 1);
    assert!(!root.join("ghost").exists());
}

// --- verify ---

#[test]
fn test_verify_clean_repository() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("small"), b"s").unwrap();
    std::fs::write(root.join("large"), vec![b'v'; 1000]).unwrap();
    let repo = t.path().join("repo");
    let index = t.path().join("index");
    run_backup(&repo, &index, &root);

    let mut ctx = context(&repo, Some(&index), None);
    verify::do_verify(&mut ctx).unwrap();
    assert_eq!(ctx.stats.errors, 0);
}

#[test]
fn test_verify_detects_corruption_and_detect_bogus_removes() {
    let t = tempfile::tempdir().unwrap();
    let root = t.path().join("root");
    std::fs::create_dir(&root).unwrap();
    let content = vec![b'c'; 1000];
    std::fs::write(root.join("large"), &content).unwrap();
    let repo = t.path().join("repo");
    let index = t.path().join("index");
    run_backup(&repo, &index, &root);

    // Flip one bit in the stored blob.
    let blob = blob_path(&repo, &content);
    let mut bytes = std::fs::read(&blob).unwrap();
    bytes[100] ^= 0x01;
    std::fs::write(&blob, &bytes).unwrap();

    let mut ctx = context(&repo, Some(&index), None);
    verify::do_verify(&mut ctx).unwrap();
    assert_eq!(ctx.stats.errors, 1);
    assert!(blob.exists());

    let mut ctx = context(&repo, Some(&index), None);
    ctx.opts.detect_bogus = true;
    verify::do_verify(&mut ctx).unwrap();
    assert_eq!(ctx.stats.errors, 1);
    assert!(!blob.exists());

    // Now the blob is simply missing: still an error, still not fatal.
    let mut ctx = context(&repo, Some(&index), None);
    verify::do_verify(&mut ctx).unwrap();
    assert_eq!(ctx.stats.errors, 1);
}

// --- cleanup ---

#[test]
fn test_cleanup_deletes_exactly_the_unreferenced() {
    let t = tempfile::tempdir().unwrap();
    let content_a = vec![b'a'; 500];
    let content_c = vec![b'c'; 500];
    let shared = vec![b's'; 500];
    let repo = t.path().join("repo");

    let root_a = t.path().join("root_a");
    std::fs::create_dir(&root_a).unwrap();
    std::fs::write(root_a.join("a"), &content_a).unwrap();
    std::fs::write(root_a.join("both"), &shared).unwrap();
    let index_x = t.path().join("index_x");
    run_backup(&repo, &index_x, &root_a);

    let root_c = t.path().join("root_c");
    std::fs::create_dir(&root_c).unwrap();
    std::fs::write(root_c.join("c"), &content_c).unwrap();
    std::fs::write(root_c.join("both"), &shared).unwrap();
    let index_y = t.path().join("index_y");
    run_backup(&repo, &index_y, &root_c);

    // An orphan blob nothing references, plus a stray temp file.
    let orphan = blob_path(&repo, b"orphan");
    std::fs::create_dir_all(orphan.parent().unwrap()).unwrap();
    std::fs::write(&orphan, b"orphan").unwrap();
    let stray = orphan.with_extension("tmp");
    std::fs::write(&stray, b"junk").unwrap();

    let indexes = [index_x.clone(), index_y.clone()];

    // Without --delete: report only.
    let mut ctx = context(&repo, None, None);
    cleanup::do_cleanup(&mut ctx, &indexes).unwrap();
    assert!(orphan.exists());
    assert!(stray.exists());

    // With --delete: exactly the unreferenced files go.
    let mut ctx = context(&repo, None, None);
    ctx.opts.delete_clean = true;
    cleanup::do_cleanup(&mut ctx, &indexes).unwrap();
    assert!(!orphan.exists());
    assert!(!stray.exists());
    assert!(blob_path(&repo, &content_a).exists());
    assert!(blob_path(&repo, &content_c).exists());
    assert!(blob_path(&repo, &shared).exists());

    // The surviving snapshots still verify clean.
    for index in &indexes {
        let mut ctx = context(&repo, Some(index), None);
        verify::do_verify(&mut ctx).unwrap();
        assert_eq!(ctx.stats.errors, 0);
    }
}

#[test]
fn test_cleanup_refuses_to_delete_past_a_bad_index() {
    let t = tempfile::tempdir().unwrap();
    let repo = t.path().join("repo");
    let orphan = blob_path(&repo, b"orphan");
    std::fs::create_dir_all(orphan.parent().unwrap()).unwrap();
    std::fs::write(&orphan, b"orphan").unwrap();

    let bad_hex = t.path().join("bad_hex");
    std::fs::write(&bad_hex, b"name=f&sha1=nothex\n[end]\n").unwrap();
    let truncated = t.path().join("truncated");
    std::fs::write(&truncated, b"name=f&data=x\n").unwrap();

    for bad in [&bad_hex, &truncated] {
        let mut ctx = context(&repo, None, None);
        ctx.opts.delete_clean = true;
        assert!(cleanup::do_cleanup(&mut ctx, &[bad.clone()]).is_err());
        assert!(ctx.stats.errors > 0);
        assert!(orphan.exists());
    }
}
