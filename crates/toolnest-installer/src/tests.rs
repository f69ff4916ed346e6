use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use toolnest_core::{Action, ArchiveType, ArtifactFamily, Catalog, PackageDescriptor};
use toolnest_resolver::{reconcile, FsToolDirectory};
use toolnest_security::sha256_hex;

use super::*;
use crate::artifact::{find_payload_root, resolve_symlink_target, safe_entry_path};
use crate::native::{build_exe_install_command, build_msi_install_command};

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn build_test_layout_path(nanos: u128) -> PathBuf {
    let mut path = std::env::temp_dir();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "toolnest-installer-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    path
}

fn test_layout() -> ToolLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let layout = ToolLayout::new(build_test_layout_path(nanos));
    layout.ensure_base_dirs().expect("must create layout dirs");
    layout
}

fn patterned_payload(len: usize) -> Vec<u8> {
    (0..len).map(|index| (index % 251) as u8).collect()
}

fn small_chunk_options(segments: usize, min_segment_bytes: u64) -> DownloadOptions {
    DownloadOptions {
        segments,
        min_segment_bytes,
        transfer_block_bytes: 512,
        ..DownloadOptions::default()
    }
}

fn no_progress(_: u64, _: u64) {}

#[derive(Debug, Clone, Copy, Default)]
struct ServerBehavior {
    omit_content_length: bool,
    ignore_range: bool,
    fail_range_starting_at: Option<u64>,
}

struct RangeServer {
    url: String,
    requests: Arc<AtomicUsize>,
}

impl RangeServer {
    fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

/// Loopback HTTP server answering HEAD and `Range` GETs for one payload.
fn start_range_server(payload: Vec<u8>, behavior: ServerBehavior) -> RangeServer {
    let listener = TcpListener::bind("127.0.0.1:0").expect("must bind range test server");
    let address = listener
        .local_addr()
        .expect("must read range test server address");
    let requests = Arc::new(AtomicUsize::new(0));
    let payload = Arc::new(payload);
    let counter = Arc::clone(&requests);

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else {
                continue;
            };
            let payload = Arc::clone(&payload);
            let counter = Arc::clone(&counter);
            thread::spawn(move || serve_request(stream, &payload, behavior, &counter));
        }
    });

    RangeServer {
        url: format!("http://{address}/artifact"),
        requests,
    }
}

fn serve_request(
    mut stream: TcpStream,
    payload: &[u8],
    behavior: ServerBehavior,
    counter: &AtomicUsize,
) {
    let Ok(read_half) = stream.try_clone() else {
        return;
    };
    let mut reader = BufReader::new(read_half);
    let mut request_line = String::new();
    if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
        return;
    }

    let mut range = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = parse_range_header(value.trim());
            }
        }
    }
    counter.fetch_add(1, Ordering::SeqCst);

    let method = request_line.split_whitespace().next().unwrap_or("");
    let mut response = Vec::new();
    if method == "HEAD" {
        if behavior.omit_content_length {
            response.extend_from_slice(b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\n");
        } else {
            response.extend_from_slice(
                format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nAccept-Ranges: bytes\r\nConnection: close\r\n\r\n",
                    payload.len()
                )
                .as_bytes(),
            );
        }
    } else {
        match range {
            Some((start, _)) if behavior.fail_range_starting_at == Some(start) => {
                response.extend_from_slice(
                    b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                );
            }
            Some((start, end)) if !behavior.ignore_range => {
                let end = end.min(payload.len() as u64 - 1);
                let body = &payload[start as usize..=end as usize];
                response.extend_from_slice(
                    format!(
                        "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {start}-{end}/{}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        payload.len(),
                        body.len()
                    )
                    .as_bytes(),
                );
                response.extend_from_slice(body);
            }
            _ => {
                response.extend_from_slice(
                    format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        payload.len()
                    )
                    .as_bytes(),
                );
                response.extend_from_slice(payload);
            }
        }
    }

    let _ = stream.write_all(&response);
    let _ = stream.flush();
}

fn parse_range_header(value: &str) -> Option<(u64, u64)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

fn write_zip(path: &Path, entries: &[(&str, Option<&str>)]) {
    let file = File::create(path).expect("must create zip fixture");
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in entries {
        match contents {
            Some(bytes) => {
                writer
                    .start_file(*name, options)
                    .expect("must start zip entry");
                writer
                    .write_all(bytes.as_bytes())
                    .expect("must write zip entry");
            }
            None => writer
                .add_directory(*name, options)
                .expect("must add zip directory"),
        }
    }
    writer.finish().expect("must finish zip fixture");
}

fn zip_bytes(entries: &[(&str, Option<&str>)]) -> Vec<u8> {
    let layout = test_layout();
    let path = layout.artifact_path("fixture.zip");
    write_zip(&path, entries);
    let bytes = fs::read(&path).expect("must read zip fixture");
    let _ = fs::remove_dir_all(layout.root());
    bytes
}

/// Writes the entry name verbatim so fixtures can carry hostile paths.
fn append_raw_tar_entry<W: Write>(builder: &mut tar::Builder<W>, name: &str, contents: &[u8], mode: u32) {
    let mut header = tar::Header::new_old();
    let name_bytes = name.as_bytes();
    header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_cksum();
    builder
        .append(&header, contents)
        .expect("must append tar entry");
}

fn write_tar_gz(path: &Path, entries: &[(&str, &str, u32)]) {
    let file = File::create(path).expect("must create tar.gz fixture");
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (name, contents, mode) in entries {
        append_raw_tar_entry(&mut builder, name, contents.as_bytes(), *mode);
    }
    let encoder = builder.into_inner().expect("must finish tar stream");
    encoder.finish().expect("must finish gzip stream");
}

/// Regular files first, then link entries pointing at `link_name`.
fn write_tar_gz_with_links(path: &Path, files: &[(&str, &str)], links: &[(&str, &str, tar::EntryType)]) {
    let file = File::create(path).expect("must create tar.gz fixture");
    let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
    for (name, contents) in files {
        append_raw_tar_entry(&mut builder, name, contents.as_bytes(), 0o755);
    }
    for (name, link_name, entry_type) in links {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(*entry_type);
        header.set_path(name).expect("must set link path");
        header.set_link_name(link_name).expect("must set link target");
        header.set_size(0);
        header.set_mode(0o777);
        header.set_cksum();
        builder
            .append(&header, std::io::empty())
            .expect("must append link entry");
    }
    let encoder = builder.into_inner().expect("must finish tar stream");
    encoder.finish().expect("must finish gzip stream");
}

#[derive(Default)]
struct RecordingNativeInstaller {
    calls: Mutex<Vec<(PathBuf, ArchiveType, PathBuf)>>,
    fail: bool,
}

impl NativeInstaller for RecordingNativeInstaller {
    fn install(
        &self,
        artifact_path: &Path,
        archive_type: ArchiveType,
        target_dir: &Path,
    ) -> anyhow::Result<()> {
        self.calls.lock().expect("calls lock").push((
            artifact_path.to_path_buf(),
            archive_type,
            target_dir.to_path_buf(),
        ));
        if self.fail {
            anyhow::bail!("installer exited with status 1603");
        }
        fs::write(target_dir.join("installed.marker"), b"ok")?;
        Ok(())
    }
}

#[test]
fn build_test_layout_path_disambiguates_same_timestamp_calls() {
    let first = build_test_layout_path(42);
    let second = build_test_layout_path(42);
    assert_ne!(first, second);
}

#[test]
fn layout_paths_hang_off_root() {
    let layout = ToolLayout::new("/opt/toolnest");
    assert_eq!(layout.package_dir("node"), Path::new("/opt/toolnest/tools/node"));
    assert_eq!(
        layout.artifact_path("node.zip"),
        Path::new("/opt/toolnest/downloads/node.zip")
    );
    assert_eq!(layout.store_path(), Path::new("/opt/toolnest/installed.json"));
    assert_eq!(layout.env_file_path(), Path::new("/opt/toolnest/sdk.env"));
    assert_eq!(layout.config_path(), Path::new("/opt/toolnest/toolnest.toml"));
}

#[test]
fn chunk_plan_covers_payload_exactly_once() {
    const MIB: u64 = 1024 * 1024;
    for total in [1, 999, MIB - 1, MIB, 5 * MIB + 3, 8 * MIB, 8 * MIB + 1, 100 * MIB + 7] {
        let plan = plan_chunks(total, 8, MIB);
        assert!(!plan.is_empty() && plan.len() <= 8, "total={total}");
        assert_eq!(plan[0].start, 0);
        assert_eq!(plan.last().expect("last chunk").end, total - 1);
        for (index, pair) in plan.windows(2).enumerate() {
            assert_eq!(pair[0].end + 1, pair[1].start, "gap after chunk {index}");
        }
        for (index, chunk) in plan.iter().enumerate() {
            assert_eq!(chunk.index, index);
            if plan.len() > 1 {
                assert!(chunk.byte_count() >= MIB, "total={total} chunk={index}");
            }
        }
        assert_eq!(plan.iter().map(ChunkRange::byte_count).sum::<u64>(), total);
        let expected_count = (total / MIB).clamp(1, 8) as usize;
        assert_eq!(plan.len(), expected_count, "total={total}");
    }
}

#[test]
fn chunk_plan_for_empty_payload_is_empty() {
    assert!(plan_chunks(0, 8, 1024).is_empty());
}

#[test]
fn chunk_range_header_is_inclusive() {
    let plan = plan_chunks(10, 2, 5);
    assert_eq!(plan[0].header_value(), "bytes=0-4");
    assert_eq!(plan[1].header_value(), "bytes=5-9");
}

#[test]
fn chunk_dir_is_named_from_destination_stem() {
    assert_eq!(
        chunk_dir_for(Path::new("/root/downloads/node-v20.zip")),
        Path::new("/root/downloads/temp_node-v20")
    );
    assert_eq!(chunk_file_name(3), "part3");
}

#[test]
fn segmented_download_assembles_chunks_in_order() {
    let layout = test_layout();
    let payload = patterned_payload(10_000);
    let server = start_range_server(payload.clone(), ServerBehavior::default());
    let destination = layout.artifact_path("tool-a-2.0.zip");
    let downloader =
        SegmentedDownloader::new(small_chunk_options(4, 1000)).expect("must build downloader");

    let max_seen = AtomicU64::new(0);
    let progress = |downloaded: u64, total: u64| {
        assert_eq!(total, 10_000);
        max_seen.fetch_max(downloaded, Ordering::SeqCst);
    };
    let outcome = downloader
        .download(&server.url, &destination, Some(sha256_hex(&payload).as_str()), &progress)
        .expect("download must succeed");

    match outcome {
        DownloadOutcome::Downloaded { bytes, chunks, .. } => {
            assert_eq!(bytes, 10_000);
            assert_eq!(chunks, 4);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(fs::read(&destination).expect("must read download"), payload);
    assert!(!chunk_dir_for(&destination).exists());
    assert_eq!(max_seen.load(Ordering::SeqCst), 10_000);
    assert_eq!(server.request_count(), 5, "one probe plus four ranges");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn download_below_minimum_chunk_uses_single_request() {
    let layout = test_layout();
    let payload = patterned_payload(500);
    let server = start_range_server(
        payload.clone(),
        ServerBehavior {
            ignore_range: true,
            ..ServerBehavior::default()
        },
    );
    let destination = layout.artifact_path("tiny.tar.gz");
    let downloader =
        SegmentedDownloader::new(small_chunk_options(8, 1000)).expect("must build downloader");

    let outcome = downloader
        .download(&server.url, &destination, None, &no_progress)
        .expect("download must succeed");

    match outcome {
        DownloadOutcome::Downloaded { bytes, chunks, .. } => {
            assert_eq!(bytes, 500);
            assert_eq!(chunks, 1);
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(fs::read(&destination).expect("must read download"), payload);
    assert_eq!(server.request_count(), 2);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn verified_existing_download_makes_no_requests() {
    let layout = test_layout();
    let payload = patterned_payload(4096);
    let server = start_range_server(payload.clone(), ServerBehavior::default());
    let destination = layout.artifact_path("cached.zip");
    fs::write(&destination, &payload).expect("must seed cached artifact");
    let downloader =
        SegmentedDownloader::new(small_chunk_options(4, 1000)).expect("must build downloader");

    let outcome = downloader
        .download(
            &server.url,
            &destination,
            Some(sha256_hex(&payload).to_ascii_uppercase().as_str()),
            &no_progress,
        )
        .expect("cache hit must succeed");

    assert_eq!(outcome, DownloadOutcome::CacheHit { bytes: 4096 });
    assert!(outcome.is_cache_hit());
    assert_eq!(server.request_count(), 0);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn stale_destination_is_replaced() {
    let layout = test_layout();
    let payload = patterned_payload(3000);
    let server = start_range_server(payload.clone(), ServerBehavior::default());
    let destination = layout.artifact_path("stale.zip");
    fs::write(&destination, b"left over from an earlier run").expect("must seed stale file");
    let downloader =
        SegmentedDownloader::new(small_chunk_options(3, 1000)).expect("must build downloader");

    downloader
        .download(&server.url, &destination, None, &no_progress)
        .expect("download must succeed");

    assert_eq!(fs::read(&destination).expect("must read download"), payload);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn hash_mismatch_removes_destination_and_chunks() {
    let layout = test_layout();
    let payload = patterned_payload(6000);
    let server = start_range_server(payload, ServerBehavior::default());
    let destination = layout.artifact_path("tampered.zip");
    let downloader =
        SegmentedDownloader::new(small_chunk_options(3, 1000)).expect("must build downloader");

    let err = downloader
        .download(
            &server.url,
            &destination,
            Some(sha256_hex(b"something else").as_str()),
            &no_progress,
        )
        .expect_err("hash mismatch must fail");

    assert!(matches!(err, DownloadError::HashMismatch { .. }), "{err}");
    assert_eq!(err.class(), ErrorClass::Integrity);
    assert!(!err.is_transient());
    assert!(!destination.exists());
    assert!(!chunk_dir_for(&destination).exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn failing_chunk_fails_whole_download_and_cleans_up() {
    let layout = test_layout();
    let payload = patterned_payload(10_000);
    let server = start_range_server(
        payload,
        ServerBehavior {
            fail_range_starting_at: Some(2500),
            ..ServerBehavior::default()
        },
    );
    let destination = layout.artifact_path("flaky.zip");
    let downloader =
        SegmentedDownloader::new(small_chunk_options(4, 1000)).expect("must build downloader");

    let err = downloader
        .download(&server.url, &destination, None, &no_progress)
        .expect_err("failing chunk must fail download");

    assert!(matches!(err, DownloadError::Network { .. }), "{err}");
    assert!(err.is_transient());
    assert!(err.to_string().contains("chunk 1"), "{err}");
    assert!(!destination.exists());
    assert!(!chunk_dir_for(&destination).exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn missing_content_length_is_size_unknown() {
    let layout = test_layout();
    let server = start_range_server(
        patterned_payload(2000),
        ServerBehavior {
            omit_content_length: true,
            ..ServerBehavior::default()
        },
    );
    let destination = layout.artifact_path("unsized.zip");
    let downloader =
        SegmentedDownloader::new(small_chunk_options(4, 1000)).expect("must build downloader");

    let err = downloader
        .download(&server.url, &destination, None, &no_progress)
        .expect_err("missing size must fail");

    assert!(matches!(err, DownloadError::SizeUnknown { .. }), "{err}");
    assert_eq!(server.request_count(), 1);
    assert!(!destination.exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn cancelled_token_stops_before_any_request() {
    let layout = test_layout();
    let server = start_range_server(patterned_payload(2000), ServerBehavior::default());
    let destination = layout.artifact_path("cancelled.zip");
    let token = CancelToken::new();
    token.cancel();
    let downloader = SegmentedDownloader::new(small_chunk_options(4, 1000))
        .expect("must build downloader")
        .with_cancel_token(token);

    let err = downloader
        .download(&server.url, &destination, None, &no_progress)
        .expect_err("cancelled download must fail");

    assert!(matches!(err, DownloadError::Cancelled));
    assert_eq!(err.class(), ErrorClass::Cancelled);
    assert_eq!(server.request_count(), 0);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn safe_entry_path_rejects_escaping_entries() {
    assert_eq!(safe_entry_path("../../evil"), None);
    assert_eq!(safe_entry_path("bin/../../evil"), None);
    assert_eq!(safe_entry_path("/etc/passwd"), None);
    assert_eq!(safe_entry_path("\\Windows\\System32"), None);
    assert_eq!(safe_entry_path("C:\\Windows\\evil.dll"), None);
    assert_eq!(safe_entry_path("./"), None);
    assert_eq!(
        safe_entry_path("node/./bin/node"),
        Some(PathBuf::from("node/bin/node"))
    );
    assert_eq!(
        safe_entry_path("php\\ext\\php_curl.dll"),
        Some(PathBuf::from("php/ext/php_curl.dll"))
    );
}

#[test]
fn zip_install_strips_single_root_folder() {
    let layout = test_layout();
    let artifact = layout.artifact_path("node-v20.11.1-win-x64.zip");
    write_zip(
        &artifact,
        &[
            ("node-v20.11.1-win-x64/", None),
            ("node-v20.11.1-win-x64/bin/node.exe", Some("MZ")),
            ("node-v20.11.1-win-x64/README.md", Some("# node")),
        ],
    );
    let artifact_size = fs::metadata(&artifact).expect("artifact metadata").len();

    let report = install_from_artifact(
        &layout,
        "node",
        "20.11.1",
        &artifact,
        &RecordingNativeInstaller::default(),
    )
    .expect("install must succeed");

    let target = layout.package_dir("node");
    assert_eq!(report.target, target);
    assert_eq!(report.bytes_installed, artifact_size);
    assert!(report.skipped_entries.is_empty());
    assert!(target.join("bin").join("node.exe").is_file());
    assert!(target.join("README.md").is_file());
    assert!(!artifact.exists(), "artifact must be removed after install");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn tar_gz_install_descends_to_binaries() {
    let layout = test_layout();
    let artifact = layout.artifact_path("pkg.tar.gz");
    write_tar_gz(
        &artifact,
        &[
            ("pkg/inner/tool.sh", "#!/bin/sh\necho tool\n", 0o755),
            ("pkg/inner/tool.conf", "key=value\n", 0o644),
        ],
    );

    install_from_artifact(
        &layout,
        "pkg",
        "1.0",
        &artifact,
        &RecordingNativeInstaller::default(),
    )
    .expect("install must succeed");

    let target = layout.package_dir("pkg");
    assert!(target.join("tool.sh").is_file());
    assert!(target.join("tool.conf").is_file());
    assert!(!target.join("pkg").exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn tar_install_rejects_path_traversal_entries() {
    let layout = test_layout();
    let artifact = layout.artifact_path("hostile.tar.gz");
    write_tar_gz(
        &artifact,
        &[
            ("../../evil.txt", "escaped", 0o644),
            ("/tmp/toolnest-absolute-evil.txt", "escaped", 0o644),
            ("ok/data.txt", "payload", 0o644),
        ],
    );

    let report = install_from_artifact(
        &layout,
        "hostile",
        "1.0",
        &artifact,
        &RecordingNativeInstaller::default(),
    )
    .expect("install must succeed with safe entries");

    assert_eq!(
        report.skipped_entries,
        vec![
            "../../evil.txt".to_string(),
            "/tmp/toolnest-absolute-evil.txt".to_string()
        ]
    );
    assert!(layout.package_dir("hostile").join("data.txt").is_file());
    assert!(!layout.root().join("evil.txt").exists());
    assert!(!layout.tools_dir().join("evil.txt").exists());
    assert!(!layout.tmp_dir().join("evil.txt").exists());
    assert!(!Path::new("/tmp/toolnest-absolute-evil.txt").exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn tar_hard_links_resolve_inside_extraction_dir() {
    let layout = test_layout();
    let artifact = layout.artifact_path("node.tar.gz");
    write_tar_gz_with_links(
        &artifact,
        &[("pkg/bin/node", "#!/bin/sh\necho node\n")],
        &[
            ("pkg/bin/node2", "pkg/bin/node", tar::EntryType::Link),
            ("pkg/bin/passwd", "etc/passwd", tar::EntryType::Link),
            ("pkg/bin/up", "../outside", tar::EntryType::Link),
        ],
    );

    let report = install_from_artifact(
        &layout,
        "node",
        "20.0",
        &artifact,
        &RecordingNativeInstaller::default(),
    )
    .expect("install must succeed");

    let bin = layout.package_dir("node").join("bin");
    assert_eq!(
        fs::read_to_string(bin.join("node2")).expect("hard link must exist"),
        "#!/bin/sh\necho node\n"
    );
    assert_eq!(
        report.skipped_entries,
        vec!["pkg/bin/passwd".to_string(), "pkg/bin/up".to_string()]
    );
    assert!(!bin.join("passwd").exists());
    assert!(!bin.join("up").exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[cfg(unix)]
#[test]
fn tar_symlinks_may_climb_within_the_archive_only() {
    let layout = test_layout();
    let artifact = layout.artifact_path("node.tar.gz");
    write_tar_gz_with_links(
        &artifact,
        &[("pkg/lib/npm-cli.js", "console.log('npm')\n")],
        &[
            ("pkg/bin/npm", "../lib/npm-cli.js", tar::EntryType::Symlink),
            ("pkg/bin/etc", "../../../etc", tar::EntryType::Symlink),
        ],
    );

    let report = install_from_artifact(
        &layout,
        "node",
        "20.0",
        &artifact,
        &RecordingNativeInstaller::default(),
    )
    .expect("install must succeed");

    let bin = layout.package_dir("node").join("bin");
    let npm = fs::symlink_metadata(bin.join("npm")).expect("npm link must exist");
    assert!(npm.file_type().is_symlink());
    assert_eq!(
        fs::read_to_string(bin.join("npm")).expect("npm link must resolve"),
        "console.log('npm')\n"
    );
    assert_eq!(report.skipped_entries, vec!["pkg/bin/etc".to_string()]);
    assert!(fs::symlink_metadata(bin.join("etc")).is_err());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn symlink_targets_resolve_against_link_directory() {
    let link = Path::new("pkg/bin/npm");
    assert_eq!(
        resolve_symlink_target(link, "../lib/npm-cli.js"),
        Some(PathBuf::from("pkg/lib/npm-cli.js"))
    );
    assert_eq!(
        resolve_symlink_target(link, "./node"),
        Some(PathBuf::from("pkg/bin/node"))
    );
    assert_eq!(resolve_symlink_target(link, "../../etc"), Some(PathBuf::from("etc")));
    assert_eq!(resolve_symlink_target(link, "../../../etc"), None);
    assert_eq!(resolve_symlink_target(link, "/etc/passwd"), None);
    assert_eq!(resolve_symlink_target(Path::new("top"), "../x"), None);
}

#[test]
fn package_names_outside_tool_root_are_refused() {
    let layout = test_layout();
    let victim = layout.root().join("victim");
    fs::create_dir_all(&victim).expect("must create victim dir");
    fs::write(victim.join("precious.txt"), "keep").expect("must write precious file");
    let artifact = layout.artifact_path("victim.tar.gz");
    write_tar_gz(&artifact, &[("bin/victim", "#!/bin/sh\n", 0o755)]);

    let err = install_from_artifact(
        &layout,
        "../victim",
        "1.0",
        &artifact,
        &RecordingNativeInstaller::default(),
    )
    .expect_err("escaping name must fail");
    assert!(matches!(err, InstallError::InvalidName { ref name, .. } if name == "../victim"));
    assert!(!artifact.exists());

    let handler = ArtifactHandler::new(Arc::new(RecordingNativeInstaller::default()));
    for name in ["../victim", "..", "."] {
        let err = handler
            .uninstall(&layout, name)
            .expect_err("escaping name must not be removed");
        assert!(matches!(err, InstallError::InvalidName { .. }));
        assert!(!handler.is_installed(&layout, name));
    }
    assert!(victim.join("precious.txt").is_file());
    assert!(layout.tools_dir().is_dir());
    assert!(matches!(
        layout.checked_package_dir("node"),
        Ok(ref dir) if dir == &layout.package_dir("node")
    ));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn plain_tar_and_gzip_artifacts_install() {
    let layout = test_layout();

    let tar_artifact = layout.artifact_path("plain.tar");
    {
        let file = File::create(&tar_artifact).expect("must create tar fixture");
        let mut builder = tar::Builder::new(file);
        append_raw_tar_entry(&mut builder, "bin/plain", b"plain", 0o755);
        append_raw_tar_entry(&mut builder, "lib/libplain.so", b"lib", 0o644);
        builder.finish().expect("must finish tar fixture");
    }
    install_from_artifact(
        &layout,
        "plain",
        "1",
        &tar_artifact,
        &RecordingNativeInstaller::default(),
    )
    .expect("tar install must succeed");
    assert!(layout.package_dir("plain").join("bin").join("plain").is_file());
    assert!(layout.package_dir("plain").join("lib").join("libplain.so").is_file());

    let gz_artifact = layout.artifact_path("single.gz");
    {
        let file = File::create(&gz_artifact).expect("must create gz fixture");
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(b"single file").expect("must write gz payload");
        encoder.finish().expect("must finish gz fixture");
    }
    install_from_artifact(
        &layout,
        "single",
        "1",
        &gz_artifact,
        &RecordingNativeInstaller::default(),
    )
    .expect("gz install must succeed");
    assert_eq!(
        fs::read(layout.package_dir("single").join("single")).expect("must read gunzipped file"),
        b"single file"
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn install_replaces_previous_target() {
    let layout = test_layout();
    let target = layout.package_dir("php");
    fs::create_dir_all(&target).expect("must create old target");
    fs::write(target.join("stale.dll"), b"old").expect("must write stale file");

    let artifact = layout.artifact_path("php-8.3.4.zip");
    write_zip(&artifact, &[("php.exe", Some("MZ")), ("php.ini", Some("[php]"))]);
    install_from_artifact(
        &layout,
        "php",
        "8.3.4",
        &artifact,
        &RecordingNativeInstaller::default(),
    )
    .expect("install must succeed");

    assert!(target.join("php.exe").is_file());
    assert!(!target.join("stale.dll").exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn empty_archive_is_empty_install_and_artifact_is_removed() {
    let layout = test_layout();
    let artifact = layout.artifact_path("empty.zip");
    write_zip(&artifact, &[("empty/", None)]);

    let err = install_from_artifact(
        &layout,
        "empty",
        "1.0",
        &artifact,
        &RecordingNativeInstaller::default(),
    )
    .expect_err("empty archive must fail");

    assert!(matches!(err, InstallError::EmptyInstall { ref name } if name == "empty"));
    assert!(!artifact.exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn unsupported_extension_fails_and_removes_artifact() {
    let layout = test_layout();
    let artifact = layout.artifact_path("tool_1.0_amd64.deb");
    fs::write(&artifact, b"!<arch>").expect("must write artifact");

    let err = install_from_artifact(
        &layout,
        "tool",
        "1.0",
        &artifact,
        &RecordingNativeInstaller::default(),
    )
    .expect_err("deb must be unsupported");

    assert!(matches!(err, InstallError::UnsupportedFormat { .. }));
    assert!(!artifact.exists());
    assert!(!layout.package_dir("tool").exists());

    fs::create_dir_all(layout.package_dir("tool").join("bin")).expect("must seed install");
    fs::write(&artifact, b"!<arch>").expect("must write artifact");
    install_from_artifact(
        &layout,
        "tool",
        "1.1",
        &artifact,
        &RecordingNativeInstaller::default(),
    )
    .expect_err("deb must be unsupported");
    assert!(!layout.package_dir("tool").exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn native_artifacts_are_handed_to_installer() {
    let layout = test_layout();
    let artifact = layout.artifact_path("GitHubDesktopSetup.exe");
    fs::write(&artifact, b"MZ").expect("must write artifact");
    let native = RecordingNativeInstaller::default();

    install_from_artifact(&layout, "github-desktop", "3.3.12", &artifact, &native)
        .expect("native install must succeed");

    let calls = native.calls.lock().expect("calls lock");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, artifact);
    assert_eq!(calls[0].1, ArchiveType::Exe);
    assert_eq!(calls[0].2, layout.package_dir("github-desktop"));
    assert!(layout
        .package_dir("github-desktop")
        .join("installed.marker")
        .is_file());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn native_failure_is_reported_and_artifact_removed() {
    let layout = test_layout();
    let artifact = layout.artifact_path("vscode.msi");
    fs::write(&artifact, b"msi").expect("must write artifact");
    let native = RecordingNativeInstaller {
        fail: true,
        ..RecordingNativeInstaller::default()
    };

    let err = install_from_artifact(&layout, "vscode", "1.88.0", &artifact, &native)
        .expect_err("native failure must surface");

    assert!(err.to_string().contains("1603"), "{err}");
    assert!(!artifact.exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn registry_routes_family_overrides_to_native_handler() {
    let layout = test_layout();
    let native = Arc::new(RecordingNativeInstaller::default());
    let mut registry = HandlerRegistry::new(native.clone());
    registry.register_family("bundled", ArtifactFamily::Native);

    assert_eq!(registry.handler_for("node").family(), ArtifactFamily::Archive);
    assert_eq!(
        registry.handler_for("bundled").family(),
        ArtifactFamily::Native
    );

    let artifact = layout.artifact_path("bundled.zip");
    write_zip(&artifact, &[("bundled.exe", Some("MZ"))]);
    let handler = registry.handler_for("bundled");
    handler
        .install(&layout, "bundled", "2.0", &artifact)
        .expect("native handler must install");

    assert_eq!(native.calls.lock().expect("calls lock").len(), 1);
    assert!(handler.is_installed(&layout, "bundled"));

    handler
        .uninstall(&layout, "bundled")
        .expect("uninstall must succeed");
    assert!(!handler.is_installed(&layout, "bundled"));
    assert!(!layout.package_dir("bundled").exists());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn native_install_commands_are_unattended() {
    let msi = build_msi_install_command(Path::new("setup.msi"), Path::new("target"));
    assert_eq!(msi.get_program(), "msiexec");
    let msi_args = msi
        .get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    assert_eq!(msi_args, vec!["/a", "setup.msi", "/qb", "TARGETDIR=target"]);

    let exe = build_exe_install_command(Path::new("setup.exe"), Path::new("target"));
    assert_eq!(exe.get_program(), "setup.exe");
    let exe_args = exe
        .get_args()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    assert_eq!(
        exe_args,
        vec!["/VERYSILENT", "/CURRENTUSER", "/NORESTART", "/DIR=target"]
    );
}

#[cfg(not(windows))]
#[test]
fn silent_native_installer_refuses_non_windows_hosts() {
    let err = SilentNativeInstaller
        .install(Path::new("setup.msi"), ArchiveType::Msi, Path::new("target"))
        .expect_err("must refuse outside windows");
    assert!(err.to_string().contains("only on Windows"));
}

#[test]
fn payload_root_stops_at_layout_directories() {
    let layout = test_layout();
    let raw = layout.tmp_dir().join("raw");
    fs::create_dir_all(raw.join("wrapper").join("bin")).expect("must create tree");
    fs::write(raw.join("wrapper").join("bin").join("tool"), b"x").expect("must write file");

    assert_eq!(find_payload_root(&raw), raw.join("wrapper"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn store_round_trip_sorts_records_and_keys() {
    let layout = test_layout();
    let installed_at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
    let mut store = VersionStore::load(layout.store_path()).expect("must load empty store");
    assert!(store.is_empty());

    store
        .record_install_at("zeta", "1.0", installed_at)
        .expect("must record zeta");
    store
        .record_install_at("alpha", "2.0", installed_at)
        .expect("must record alpha");

    let raw = fs::read_to_string(layout.store_path()).expect("must read store file");
    let alpha = raw.find("\"alpha\"").expect("alpha present");
    let zeta = raw.find("\"zeta\"").expect("zeta present");
    assert!(alpha < zeta, "records must be sorted by name");
    let installed_key = raw.find("\"installed_date\"").expect("installed_date key");
    let name_key = raw.find("\"name\"").expect("name key");
    let version_key = raw.find("\"version\"").expect("version key");
    assert!(installed_key < name_key && name_key < version_key, "keys must be sorted");
    assert!(raw.contains("\n  {"), "store must be indented");

    let reloaded = VersionStore::load(layout.store_path()).expect("must reload store");
    assert_eq!(reloaded.names(), vec!["alpha", "zeta"]);
    assert_eq!(reloaded.get("alpha"), store.get("alpha"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn store_update_appends_history() {
    let layout = test_layout();
    let mut store = VersionStore::load(layout.store_path()).expect("must load store");
    let installed_at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
    let updated_at = Utc.with_ymd_and_hms(2024, 4, 2, 8, 0, 0).unwrap();

    store
        .record_install_at("tool-a", "1.0", installed_at)
        .expect("must record install");
    store
        .record_update_at("tool-a", "2.0", updated_at)
        .expect("must record update");

    let reloaded = VersionStore::load(layout.store_path()).expect("must reload store");
    let record = reloaded.get("tool-a").expect("record present");
    assert_eq!(record.version, "2.0");
    assert_eq!(record.previous_version.as_deref(), Some("1.0"));
    assert_eq!(record.update_count, 1);
    assert_eq!(record.version_history.len() as u64, record.update_count);
    assert_eq!(record.installed_date, installed_at);
    assert_eq!(record.last_updated, updated_at);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn store_update_of_unknown_name_records_install() {
    let layout = test_layout();
    let mut store = VersionStore::load(layout.store_path()).expect("must load store");

    store
        .record_update("stray", "3.1")
        .expect("must record update");

    let record = store.get("stray").expect("record present");
    assert_eq!(record.update_count, 0);
    assert!(record.version_history.is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn store_remove_reports_presence() {
    let layout = test_layout();
    let mut store = VersionStore::load(layout.store_path()).expect("must load store");
    store.record_install("tool-b", "1.0").expect("must record");

    assert!(store.remove("tool-b").expect("must remove"));
    assert!(!store.remove("tool-b").expect("second remove is a no-op"));
    let reloaded = VersionStore::load(layout.store_path()).expect("must reload store");
    assert!(reloaded.is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn corrupt_store_is_parse_error() {
    let layout = test_layout();
    fs::write(layout.store_path(), "{not json").expect("must write corrupt store");

    let err = VersionStore::load(layout.store_path()).expect_err("corrupt store must fail");
    assert!(matches!(err, StoreError::Parse { .. }));
    assert_eq!(err.class(), ErrorClass::State);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn env_file_lists_homes_and_existing_subdirs() {
    let layout = test_layout();
    fs::create_dir_all(layout.package_dir("node js").join("bin")).expect("must create bin");
    fs::create_dir_all(layout.package_dir("php").join("lib")).expect("must create lib");

    let rendered = render_env_file(&layout, ["php", "node js"]);
    let pairs = parse_env_file(&rendered);
    let keys = pairs.iter().map(|(key, _)| key.as_str()).collect::<Vec<_>>();

    assert!(rendered.starts_with("# "));
    assert_eq!(
        keys,
        vec!["SDK_ROOT", "NODE_JS_HOME", "NODE_JS_BIN", "PHP_HOME", "PHP_LIB"]
    );
    assert_eq!(pairs[0].1, layout.tools_dir().display().to_string());
    assert!(Path::new(&pairs[0].1).is_absolute());
    assert_eq!(
        pairs[1].1,
        layout.package_dir("node js").display().to_string()
    );

    let path = write_env_file(&layout, ["php"]).expect("must write env file");
    assert_eq!(path, layout.env_file_path());
    let written = read_env_file(&path).expect("must read env file");
    assert_eq!(written.len(), 3);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn env_parse_splits_on_first_equals() {
    let pairs = parse_env_file("# comment\n\nJAVA_OPTS=-Dkey=value\n  \nBROKEN LINE\n");
    assert_eq!(
        pairs,
        vec![("JAVA_OPTS".to_string(), "-Dkey=value".to_string())]
    );
    assert_eq!(env_var_prefix("Node JS"), "NODE_JS");
}

fn one_package_catalog(url: &str, name: &str, version: &str) -> Catalog {
    Catalog::new(vec![PackageDescriptor {
        name: name.to_string(),
        version: version.to_string(),
        url: url.to_string(),
        description: String::new(),
        hash: None,
    }])
    .expect("catalog must build")
}

fn apply_with_artifact(
    layout: &ToolLayout,
    store: &mut VersionStore,
    downloader: &SegmentedDownloader,
    catalog: &Catalog,
    actions: &[Action],
) {
    let registry = HandlerRegistry::new(Arc::new(RecordingNativeInstaller::default()));
    for action in actions {
        let handler = registry.handler_for(action.name());
        match action {
            Action::Install { name, version }
            | Action::Upgrade {
                name,
                to_version: version,
                ..
            } => {
                let descriptor = catalog.get(name).expect("catalog entry");
                let artifact = layout.artifact_path(&format!("{name}-{version}.zip"));
                downloader
                    .download(&descriptor.url, &artifact, None, &no_progress)
                    .expect("download must succeed");
                if matches!(action, Action::Upgrade { .. }) {
                    handler
                        .update(layout, name, version, &artifact)
                        .expect("update must succeed");
                    store
                        .record_update(name, version)
                        .expect("must record update");
                } else {
                    handler
                        .install(layout, name, version, &artifact)
                        .expect("install must succeed");
                    store
                        .record_install(name, version)
                        .expect("must record install");
                }
            }
            Action::Remove { name, .. } => {
                handler.uninstall(layout, name).expect("uninstall must succeed");
                store.remove(name).expect("must remove record");
            }
        }
    }
}

#[test]
fn install_then_reconcile_reaches_fixed_point() {
    let layout = test_layout();
    let archive = zip_bytes(&[("tool-a/tool-a.exe", Some("MZ"))]);
    let server = start_range_server(archive, ServerBehavior::default());
    let catalog = one_package_catalog(&server.url, "tool-a", "2.0");
    let tools = FsToolDirectory::new(layout.tools_dir());
    let downloader =
        SegmentedDownloader::new(small_chunk_options(2, 64)).expect("must build downloader");
    let mut store = VersionStore::load(layout.store_path()).expect("must load store");

    let plan = reconcile(&catalog, &mut store, &tools).expect("must reconcile");
    assert_eq!(
        plan.actions,
        vec![Action::Install {
            name: "tool-a".to_string(),
            version: "2.0".to_string(),
        }]
    );

    apply_with_artifact(&layout, &mut store, &downloader, &catalog, &plan.actions);

    assert!(dir_is_populated(&layout.package_dir("tool-a")));
    let record = store.get("tool-a").expect("record present");
    assert_eq!(record.version, "2.0");
    assert_eq!(record.update_count, 0);

    let mut reloaded = VersionStore::load(layout.store_path()).expect("must reload store");
    let second = reconcile(&catalog, &mut reloaded, &tools).expect("must reconcile");
    assert!(second.actions.is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn upgrade_apply_records_history() {
    let layout = test_layout();
    let archive = zip_bytes(&[("tool-a.exe", Some("MZ v2"))]);
    let server = start_range_server(archive, ServerBehavior::default());
    let catalog = one_package_catalog(&server.url, "tool-a", "2.0");
    let tools = FsToolDirectory::new(layout.tools_dir());
    let downloader =
        SegmentedDownloader::new(small_chunk_options(2, 64)).expect("must build downloader");

    fs::create_dir_all(layout.package_dir("tool-a")).expect("must create tool dir");
    fs::write(layout.package_dir("tool-a").join("tool-a.exe"), b"MZ v1").expect("must write");
    let mut store = VersionStore::load(layout.store_path()).expect("must load store");
    store.record_install("tool-a", "1.0").expect("must seed record");

    let plan = reconcile(&catalog, &mut store, &tools).expect("must reconcile");
    assert_eq!(
        plan.actions,
        vec![Action::Upgrade {
            name: "tool-a".to_string(),
            from_version: "1.0".to_string(),
            to_version: "2.0".to_string(),
        }]
    );

    apply_with_artifact(&layout, &mut store, &downloader, &catalog, &plan.actions);

    let record = store.get("tool-a").expect("record present");
    assert_eq!(record.update_count, 1);
    assert_eq!(record.version_history.len(), 1);
    assert_eq!(record.version_history[0].from_version, "1.0");
    assert_eq!(record.version_history[0].to_version, "2.0");
    assert_eq!(
        fs::read(layout.package_dir("tool-a").join("tool-a.exe")).expect("must read binary"),
        b"MZ v2"
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn removal_apply_deletes_directory_and_record() {
    let layout = test_layout();
    let catalog = Catalog::new(Vec::new()).expect("empty catalog");
    let tools = FsToolDirectory::new(layout.tools_dir());
    let downloader =
        SegmentedDownloader::new(DownloadOptions::default()).expect("must build downloader");

    fs::create_dir_all(layout.package_dir("tool-b")).expect("must create tool dir");
    fs::write(layout.package_dir("tool-b").join("tool-b.exe"), b"MZ").expect("must write");
    let mut store = VersionStore::load(layout.store_path()).expect("must load store");
    store.record_install("tool-b", "1.0").expect("must seed record");

    let plan = reconcile(&catalog, &mut store, &tools).expect("must reconcile");
    assert_eq!(
        plan.actions,
        vec![Action::Remove {
            name: "tool-b".to_string(),
            version: "1.0".to_string(),
        }]
    );

    apply_with_artifact(&layout, &mut store, &downloader, &catalog, &plan.actions);

    assert!(!layout.package_dir("tool-b").exists());
    assert!(store.get("tool-b").is_none());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn orphan_record_is_pruned_from_store_file() {
    let layout = test_layout();
    let catalog = one_package_catalog("https://example.test/tool-a.zip", "tool-a", "1.0");
    let tools = FsToolDirectory::new(layout.tools_dir());
    let mut store = VersionStore::load(layout.store_path()).expect("must load store");
    store.record_install("tool-a", "1.0").expect("must seed record");

    let plan = reconcile(&catalog, &mut store, &tools).expect("must reconcile");

    assert_eq!(plan.pruned, vec!["tool-a"]);
    assert!(matches!(plan.actions.as_slice(), [Action::Install { .. }]));
    let reloaded = VersionStore::load(layout.store_path()).expect("must reload store");
    assert!(reloaded.is_empty());

    let _ = fs::remove_dir_all(layout.root());
}
