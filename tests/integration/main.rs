//! Integration tests for pkgmill

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// Binary pinned to a config file inside `dir`
    fn pkgmill(dir: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("pkgmill");
        cmd.env("PKGMILL_CONFIG", dir.path().join("config.toml"));
        cmd
    }

    #[test]
    fn help_displays() {
        let dir = TempDir::new().unwrap();
        pkgmill(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Distribution packaging toolkit"));
    }

    #[test]
    fn version_displays() {
        let dir = TempDir::new().unwrap();
        pkgmill(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("pkgmill"));
    }

    #[test]
    fn mirror_list_shows_builtins() {
        let dir = TempDir::new().unwrap();
        pkgmill(&dir)
            .args(["mirror", "list"])
            .assert()
            .success()
            .stdout(
                predicate::str::contains("arch")
                    .and(predicate::str::contains("8901"))
                    .and(predicate::str::contains("opensuse")),
            );
    }

    #[test]
    fn install_command_uses_configured_port() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "[mirrors.alpine]\nport = 18901\n",
        )
        .unwrap();

        pkgmill(&dir)
            .args(["mirror", "install-command", "alpine"])
            .assert()
            .success()
            .stdout(
                predicate::str::contains(":18901/").and(predicate::str::contains("/etc/apk/repositories")),
            );
    }

    #[test]
    fn unknown_mirror_fails() {
        let dir = TempDir::new().unwrap();
        pkgmill(&dir)
            .args(["mirror", "install-command", "gentoo"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Unknown mirror: gentoo"));
    }

    #[test]
    fn invalid_config_fails_with_path() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("config.toml"), "[cache\n").unwrap();
        pkgmill(&dir)
            .args(["mirror", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid configuration"));
    }

    #[test]
    fn status_runs() {
        // Fails the runtime check on hosts without docker/podman, but must not crash
        let dir = TempDir::new().unwrap();
        pkgmill(&dir)
            .arg("status")
            .assert()
            .stdout(predicate::str::contains("Container runtime:"));
    }
}

/// Minimal upstream repository server counting the requests it answers
mod fake_upstream {
    use bytes::Bytes;
    use http_body_util::Full;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Method, Request, Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::collections::HashMap;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;

    #[derive(Clone)]
    struct Resource {
        body: Bytes,
        content_type: &'static str,
        last_modified: Option<&'static str>,
    }

    #[derive(Default)]
    struct State {
        files: Mutex<HashMap<String, Resource>>,
        gets: AtomicUsize,
        heads: AtomicUsize,
    }

    pub struct FakeUpstream {
        state: Arc<State>,
        port: u16,
        _shutdown: oneshot::Sender<()>,
    }

    async fn respond(state: Arc<State>, request: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
        let head = request.method() == Method::HEAD;
        if head {
            state.heads.fetch_add(1, Ordering::SeqCst);
        } else {
            state.gets.fetch_add(1, Ordering::SeqCst);
        }

        let resource = state.files.lock().unwrap().get(request.uri().path()).cloned();
        let Some(resource) = resource else {
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::NOT_FOUND;
            return Ok(response);
        };

        let mut builder = Response::builder()
            .header("content-type", resource.content_type)
            .header("content-length", resource.body.len());
        if let Some(date) = resource.last_modified {
            builder = builder.header("last-modified", date);
        }
        let body = if head { Bytes::new() } else { resource.body };
        Ok(builder.body(Full::new(body)).unwrap())
    }

    impl FakeUpstream {
        pub fn start() -> Self {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.set_nonblocking(true).unwrap();
            let port = listener.local_addr().unwrap().port();

            let state = Arc::new(State::default());
            let shared = state.clone();
            let (shutdown, mut stop) = oneshot::channel::<()>();

            std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                runtime.block_on(async move {
                    let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                    loop {
                        tokio::select! {
                            _ = &mut stop => break,
                            accepted = listener.accept() => {
                                let Ok((stream, _)) = accepted else { continue };
                                let state = shared.clone();
                                tokio::spawn(async move {
                                    let service = service_fn(move |request| respond(state.clone(), request));
                                    let _ = http1::Builder::new()
                                        .serve_connection(TokioIo::new(stream), service)
                                        .await;
                                });
                            }
                        }
                    }
                });
            });

            Self {
                state,
                port,
                _shutdown: shutdown,
            }
        }

        pub fn url(&self) -> String {
            format!("http://127.0.0.1:{}/", self.port)
        }

        fn insert(&self, path: &str, body: impl Into<Bytes>, content_type: &'static str, last_modified: Option<&'static str>) {
            self.state.files.lock().unwrap().insert(
                path.to_string(),
                Resource {
                    body: body.into(),
                    content_type,
                    last_modified,
                },
            );
        }

        pub fn file(&self, path: &str, body: impl Into<Bytes>) {
            self.insert(path, body, "application/octet-stream", None);
        }

        pub fn dated_file(&self, path: &str, body: impl Into<Bytes>, last_modified: &'static str) {
            self.insert(path, body, "application/octet-stream", Some(last_modified));
        }

        pub fn listing(&self, path: &str, html: &'static str) {
            self.insert(path, html, "text/html; charset=utf-8", None);
        }

        pub fn gets(&self) -> usize {
            self.state.gets.load(Ordering::SeqCst)
        }

        pub fn heads(&self) -> usize {
            self.state.heads.load(Ordering::SeqCst)
        }
    }
}

mod mirror_tests {
    use super::fake_upstream::FakeUpstream;
    use pkgmill::mirror::{CachedMirror, Freshness, MirrorConfig, Timeouts};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::path::Path;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};
    use tempfile::TempDir;

    const PACKAGE: &str = "/core/os/x86_64/zlib-1.3.1-2-x86_64.pkg.tar.zst";
    const INDEX: &str = "/core/os/x86_64/core.db";

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn mirror(upstream: &FakeUpstream, dir: &Path) -> CachedMirror {
        let config = MirrorConfig::new("test", upstream.url(), dir, 0)
            .index_patterns(&["*.db"])
            .unwrap()
            .ignore_patterns(&["*.db.sig"])
            .unwrap()
            .freshness(&[Freshness::LastModified]);
        CachedMirror::new(config)
    }

    fn agent() -> ureq::Agent {
        ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .into()
    }

    struct Reply {
        status: u16,
        content_range: Option<String>,
        body: Vec<u8>,
    }

    fn get(port: u16, path: &str, range: Option<&str>) -> Reply {
        let mut request = agent().get(format!("http://127.0.0.1:{}{}", port, path));
        if let Some(range) = range {
            request = request.header("Range", range);
        }
        let mut response = request.call().unwrap();
        let content_range = response
            .headers()
            .get("content-range")
            .map(|v| v.to_str().unwrap().to_string());
        Reply {
            status: response.status().as_u16(),
            content_range,
            body: response.body_mut().read_to_vec().unwrap(),
        }
    }

    /// Send a raw request line and return the status line
    fn raw_status(port: u16, target: &str) -> String {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n", target).unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response.lines().next().unwrap_or_default().to_string()
    }

    fn leftover_parts(dir: &Path) -> usize {
        walk(dir)
            .iter()
            .filter(|p| p.extension().is_some_and(|e| e == "part"))
            .count()
    }

    fn walk(dir: &Path) -> Vec<std::path::PathBuf> {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .flat_map(|e| {
                let path = e.path();
                if path.is_dir() {
                    walk(&path)
                } else {
                    vec![path]
                }
            })
            .collect()
    }

    #[test]
    fn package_is_fetched_once_then_served_from_cache() {
        let upstream = FakeUpstream::start();
        let content = patterned(100_000);
        upstream.file(PACKAGE, content.clone());
        let dir = TempDir::new().unwrap();
        let mirror = mirror(&upstream, dir.path());

        let guard = mirror.enter().unwrap();
        let first = get(guard.port(), PACKAGE, None);
        assert_eq!(first.status, 200);
        assert_eq!(first.body, content);

        let second = get(guard.port(), PACKAGE, None);
        assert_eq!(second.body, content);
        assert_eq!(upstream.gets(), 1);
        drop(guard);

        let cached = std::fs::read(dir.path().join(PACKAGE.trim_start_matches('/'))).unwrap();
        assert_eq!(cached, content);
        assert_eq!(leftover_parts(dir.path()), 0);
    }

    #[test]
    fn range_of_uncached_file_is_sliced_and_whole_file_cached() {
        let upstream = FakeUpstream::start();
        let content = patterned(8192);
        upstream.file(PACKAGE, content.clone());
        let dir = TempDir::new().unwrap();
        let mirror = mirror(&upstream, dir.path());

        let guard = mirror.enter().unwrap();
        let reply = get(guard.port(), PACKAGE, Some("bytes=1000-1008"));
        assert_eq!(reply.status, 206);
        assert_eq!(reply.body, &content[1000..1009]);
        assert_eq!(reply.content_range.as_deref(), Some("bytes 1000-1008/8192"));
        drop(guard);

        let cached = std::fs::read(dir.path().join(PACKAGE.trim_start_matches('/'))).unwrap();
        assert_eq!(cached, content);
    }

    #[test]
    fn cached_file_honors_ranges() {
        let upstream = FakeUpstream::start();
        let content = patterned(4096);
        upstream.file(PACKAGE, content.clone());
        let dir = TempDir::new().unwrap();
        let mirror = mirror(&upstream, dir.path());
        let guard = mirror.enter().unwrap();
        get(guard.port(), PACKAGE, None);

        let resumed = get(guard.port(), PACKAGE, Some("bytes=4000-"));
        assert_eq!(resumed.status, 206);
        assert_eq!(resumed.body, &content[4000..]);
        assert_eq!(resumed.content_range.as_deref(), Some("bytes 4000-4095/4096"));

        let head = get(guard.port(), PACKAGE, Some("bytes=0-999"));
        let tail = get(guard.port(), PACKAGE, Some("bytes=1000-"));
        assert_eq!([head.body, tail.body].concat(), content);

        let suffix = get(guard.port(), PACKAGE, Some("bytes=-10"));
        assert_eq!(suffix.body, &content[4086..]);

        let beyond = get(guard.port(), PACKAGE, Some("bytes=5000-"));
        assert_eq!(beyond.status, 416);
        assert_eq!(beyond.content_range.as_deref(), Some("bytes */4096"));

        assert_eq!(upstream.gets(), 1);
    }

    #[test]
    fn index_is_refetched_only_when_upstream_is_newer() {
        let upstream = FakeUpstream::start();
        upstream.dated_file(INDEX, "old index", "Wed, 21 Oct 2015 07:28:00 GMT");
        let dir = TempDir::new().unwrap();
        let mirror = mirror(&upstream, dir.path());
        let guard = mirror.enter().unwrap();

        assert_eq!(get(guard.port(), INDEX, None).body, b"old index");
        // Cached copy is newer than upstream's Last-Modified
        assert_eq!(get(guard.port(), INDEX, None).body, b"old index");
        assert_eq!(upstream.gets(), 1);
        assert_eq!(upstream.heads(), 1);

        // Upstream changed after the cached copy was written
        upstream.dated_file(INDEX, "new index", "Wed, 21 Oct 2015 07:28:00 GMT");
        let cache = dir.path().join(INDEX.trim_start_matches('/'));
        let before_upstream = UNIX_EPOCH + Duration::from_secs(1_400_000_000);
        std::fs::File::options()
            .write(true)
            .open(&cache)
            .unwrap()
            .set_modified(before_upstream)
            .unwrap();

        assert_eq!(get(guard.port(), INDEX, None).body, b"new index");
        assert_eq!(upstream.gets(), 2);
        drop(guard);

        assert_eq!(std::fs::read(&cache).unwrap(), b"new index");
        assert!(std::fs::metadata(&cache).unwrap().modified().unwrap() > SystemTime::now() - Duration::from_secs(3600));
    }

    #[test]
    fn upstream_errors_are_relayed_without_caching() {
        let upstream = FakeUpstream::start();
        let dir = TempDir::new().unwrap();
        let mirror = mirror(&upstream, dir.path());
        let guard = mirror.enter().unwrap();

        let reply = get(guard.port(), "/core/os/x86_64/missing-1-1-any.pkg.tar.zst", None);
        assert_eq!(reply.status, 404);
        drop(guard);

        assert!(!dir.path().join("core/os/x86_64/missing-1-1-any.pkg.tar.zst").exists());
        assert_eq!(leftover_parts(dir.path()), 0);
    }

    #[test]
    fn unreachable_upstream_is_bad_gateway() {
        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let dir = TempDir::new().unwrap();
        let mirror = CachedMirror::new(MirrorConfig::new(
            "offline",
            format!("http://127.0.0.1:{}", port),
            dir.path(),
            0,
        ));
        let guard = mirror.enter().unwrap();
        assert_eq!(get(guard.port(), PACKAGE, None).status, 502);
    }

    #[test]
    fn ignored_and_escaping_paths_are_not_found() {
        let upstream = FakeUpstream::start();
        upstream.file("/core/os/x86_64/core.db.sig", "signature");
        let dir = TempDir::new().unwrap();
        let mirror = mirror(&upstream, dir.path());
        let guard = mirror.enter().unwrap();

        assert_eq!(get(guard.port(), "/core/os/x86_64/core.db.sig", None).status, 404);
        assert!(raw_status(guard.port(), "/core/../../etc/passwd").contains("404"));
        assert_eq!(upstream.gets(), 0);
    }

    #[test]
    fn html_listings_pass_through_uncached() {
        let upstream = FakeUpstream::start();
        upstream.listing("/core/os/", "<html>listing</html>");
        let dir = TempDir::new().unwrap();
        let mirror = mirror(&upstream, dir.path());
        let guard = mirror.enter().unwrap();

        let reply = get(guard.port(), "/core/os/", None);
        assert_eq!(reply.status, 200);
        assert_eq!(reply.body, b"<html>listing</html>");
        get(guard.port(), "/core/os/", None);
        assert_eq!(upstream.gets(), 2);
        drop(guard);

        assert!(walk(dir.path()).is_empty());
    }

    fn head(port: u16, path: &str) -> u16 {
        agent()
            .head(format!("http://127.0.0.1:{}{}", port, path))
            .call()
            .unwrap()
            .status()
            .as_u16()
    }

    #[test]
    fn head_requests_follow_the_cache() {
        let upstream = FakeUpstream::start();
        upstream.file(PACKAGE, "pkg");
        let dir = TempDir::new().unwrap();
        let mirror = mirror(&upstream, dir.path());
        let guard = mirror.enter().unwrap();

        // Uncached: upstream decides
        assert_eq!(head(guard.port(), PACKAGE), 200);
        assert_eq!(head(guard.port(), "/core/os/x86_64/absent.pkg.tar.zst"), 404);
        assert_eq!(upstream.heads(), 2);

        get(guard.port(), PACKAGE, None);
        assert_eq!(head(guard.port(), PACKAGE), 200);
        assert_eq!(head(guard.port(), "/core/os/x86_64"), 404);
        assert_eq!(upstream.heads(), 2);
        assert_eq!(upstream.gets(), 1);
    }

    #[test]
    fn other_methods_are_rejected() {
        let upstream = FakeUpstream::start();
        let dir = TempDir::new().unwrap();
        let mirror = mirror(&upstream, dir.path());
        let guard = mirror.enter().unwrap();

        let response = agent()
            .post(format!("http://127.0.0.1:{}{}", guard.port(), PACKAGE))
            .send_empty()
            .unwrap();
        assert_eq!(response.status().as_u16(), 405);
    }

    #[test]
    fn download_completes_after_client_disconnects() {
        let upstream = FakeUpstream::start();
        let content = patterned(4 * 1024 * 1024);
        upstream.file(PACKAGE, content.clone());
        let dir = TempDir::new().unwrap();
        let mirror = mirror(&upstream, dir.path());
        let guard = mirror.enter().unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", guard.port())).unwrap();
        write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", PACKAGE).unwrap();
        let mut start = [0u8; 1024];
        assert!(stream.read(&mut start).unwrap() > 0);
        drop(stream);

        // Stopping the server waits for in-flight downloads
        drop(guard);

        let cached = std::fs::read(dir.path().join(PACKAGE.trim_start_matches('/'))).unwrap();
        assert_eq!(cached.len(), content.len());
        assert_eq!(cached, content);
    }

    /// Upstream that accepts connections and never answers them
    fn silent_upstream() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        std::thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming().flatten() {
                held.push(stream);
            }
        });
        format!("http://127.0.0.1:{}", port)
    }

    /// Drop `guard` on another thread, failing if that takes longer than `limit`
    fn drop_within(guard: pkgmill::mirror::MirrorGuard, limit: Duration) {
        let (done, finished) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            drop(guard);
            let _ = done.send(());
        });
        finished
            .recv_timeout(limit)
            .expect("mirror scope exit blocked on a stalled download");
    }

    #[test]
    fn stalled_upstream_does_not_block_scope_exit() {
        let dir = TempDir::new().unwrap();
        let timeouts = Timeouts {
            shutdown: Duration::from_secs(1),
            ..Timeouts::default()
        };
        let mirror = CachedMirror::new(
            MirrorConfig::new("stalled", silent_upstream(), dir.path(), 0).timeouts(timeouts),
        );
        let guard = mirror.enter().unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", guard.port())).unwrap();
        write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", PACKAGE).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
        let mut buffer = [0u8; 64];
        assert!(stream.read(&mut buffer).is_err());
        drop(stream);

        drop_within(guard, Duration::from_secs(15));
        assert!(!mirror.is_running());
        assert!(!dir.path().join(PACKAGE.trim_start_matches('/')).exists());
    }

    #[test]
    fn unanswered_upstream_request_times_out() {
        let dir = TempDir::new().unwrap();
        let timeouts = Timeouts {
            response: Duration::from_secs(1),
            ..Timeouts::default()
        };
        let mirror = CachedMirror::new(
            MirrorConfig::new("stalled", silent_upstream(), dir.path(), 0).timeouts(timeouts),
        );
        let guard = mirror.enter().unwrap();

        assert_eq!(get(guard.port(), PACKAGE, None).status, 504);
        drop_within(guard, Duration::from_secs(15));
        assert_eq!(leftover_parts(dir.path()), 0);
    }

    #[test]
    fn nested_scopes_share_the_server() {
        let upstream = FakeUpstream::start();
        upstream.file(PACKAGE, "pkg");
        let dir = TempDir::new().unwrap();
        let mirror = mirror(&upstream, dir.path());

        let outer = mirror.enter().unwrap();
        let port = outer.port();
        {
            let inner = mirror.clone().enter().unwrap();
            assert_eq!(inner.port(), port);
            assert_eq!(get(inner.port(), PACKAGE, None).body, b"pkg");
        }
        // Still served after the inner scope ended
        assert_eq!(get(port, PACKAGE, None).body, b"pkg");
        drop(outer);
        assert!(!mirror.is_running());
    }
}

mod container_tests {
    use pkgmill::config::Config;
    use pkgmill::orchestration::{ContainerEngine, RunOptions};
    use pkgmill::process::{Invocation, ProcessRunner, SystemRunner};
    use tempfile::TempDir;

    const IMAGE: &str = "docker.io/library/alpine:latest";

    /// Engine for the host's runtime, or `None` when docker/podman or the
    /// test image is unavailable
    async fn engine(dir: &TempDir) -> Option<ContainerEngine> {
        let mut config = Config::default();
        config.cache.root = Some(dir.path().to_path_buf());
        let engine = ContainerEngine::from_config(&config).with_verbosity(0);
        if engine.detector().info().await.is_err() {
            return None;
        }
        match engine.image_exists(IMAGE).await {
            Ok(true) => Some(engine),
            _ => None,
        }
    }

    #[tokio::test]
    async fn run_captures_output_and_files() {
        let dir = TempDir::new().unwrap();
        let Some(engine) = engine(&dir).await else {
            return;
        };

        let session = engine
            .run(IMAGE, "echo hello > /greeting\ncat /greeting", RunOptions::default())
            .await
            .unwrap();
        assert!(session.output().contains("hello"));
        assert_eq!(session.file("/greeting").await.unwrap(), b"hello\n");
        session.remove().await.unwrap();
    }

    #[tokio::test]
    async fn dropped_session_removes_container() {
        let dir = TempDir::new().unwrap();
        let Some(engine) = engine(&dir).await else {
            return;
        };

        let session = engine.run(IMAGE, "true", RunOptions::default()).await.unwrap();
        let id = session.id().to_string();
        drop(session);

        let program = engine.detector().info().await.unwrap().program;
        let inspect = Invocation::new(program).args(["container", "inspect", id.as_str()]);
        let output = SystemRunner.capture(&inspect, false).await.unwrap();
        assert!(!output.success());
    }

    #[tokio::test]
    async fn failing_command_reports_output() {
        let dir = TempDir::new().unwrap();
        let Some(engine) = engine(&dir).await else {
            return;
        };

        let err = engine
            .run(IMAGE, "echo about to fail; exit 3", RunOptions::default())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("about to fail"));
        assert!(message.contains("run --rm"));
    }
}
