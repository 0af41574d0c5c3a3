//! End-to-end interception tests against Rhai scripts on disk

use bytes::Bytes;
use http::header::HeaderValue;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use sluice_core::response::responses;
use sluice_core::{handler_fn, Body, Middleware, Next, ResponseSink};
use sluice_scripting::prelude::*;
use sluice_scripting::LifecycleEventKind;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

struct App {
    dir: TempDir,
    stamp: PathBuf,
    base: SystemTime,
}

impl App {
    fn new(entry: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("app")).unwrap();
        let stamp = dir.path().join("deploy.stamp");
        File::create(&stamp).unwrap();
        let base = SystemTime::now() - Duration::from_secs(3600);
        set_mtime(&stamp, base);

        let app = Self { dir, stamp, base };
        app.write("config", entry);
        app
    }

    fn write(&self, module: &str, source: &str) {
        let path = self.dir.path().join("app").join(format!("{module}.rhai"));
        fs::write(path, source).unwrap();
    }

    fn redeploy(&self, offset: u64) {
        set_mtime(&self.stamp, self.base + Duration::from_secs(offset));
    }

    fn config(&self) -> InterceptConfig {
        InterceptConfig::new(self.dir.path()).with_watched_path(&self.stamp)
    }

    fn dispatcher(&self) -> InterceptDispatcher {
        let manager = Arc::new(EngineLifecycleManager::with_rhai(self.config()));
        manager.start();
        InterceptDispatcher::new(manager)
    }
}

fn set_mtime(path: &Path, time: SystemTime) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(time)
        .unwrap();
}

fn echo_chain() -> Arc<dyn HandlerChain> {
    Arc::new(chain_fn(|req: Request<Body>, res: &mut dyn ResponseSink| {
        res.set_status(StatusCode::OK, None);
        res.set_content_type(HeaderValue::from_static("text/plain"));
        res.print(&format!("hello from {}", req.uri().path()))?;
        if let Some(query) = req.uri().query() {
            res.print(&format!("?{query}"))?;
        }
        if let Some(user) = req.headers().get("x-user").and_then(|v| v.to_str().ok()) {
            res.print(&format!(" as {user}"))?;
        }
        Ok(())
    }))
}

struct Reply {
    status: StatusCode,
    content_type: Option<String>,
    header: Option<String>,
    body: String,
    outcome: InterceptOutcome,
}

async fn get(dispatcher: &InterceptDispatcher, uri: &str) -> Reply {
    let request = Request::builder()
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (response, outcome) = dispatcher.dispatch(request, echo_chain()).await.unwrap();

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };
    let status = response.status();
    let content_type = header("content-type");
    let kind = header("x-kind");
    let bytes = response.into_body().collect().await.unwrap().to_bytes();

    Reply {
        status,
        content_type,
        header: kind,
        body: String::from_utf8(bytes.to_vec()).unwrap(),
        outcome,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_capture_rewrites_chain_output() {
    let app = App::new(
        r#"
        fn app(req, res, chain) {
            let buf = chain.capture();
            buf.body = buf.body.to_upper();
            buf
        }
        "#,
    );
    let dispatcher = app.dispatcher();

    let reply = get(&dispatcher, "/greet").await;
    assert_eq!(reply.outcome, InterceptOutcome::EngineHandledViaCapture);
    assert_eq!(reply.status, StatusCode::OK);
    assert_eq!(reply.body, "HELLO FROM /GREET");
    assert_eq!(reply.content_type.as_deref(), Some("text/plain"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_thrown_error_renders_diagnostic_page() {
    let app = App::new(
        r#"
        fn app(req, res, chain) {
            throw "boom";
        }
        "#,
    );
    let dispatcher = app.dispatcher();

    let reply = get(&dispatcher, "/").await;
    assert_eq!(reply.outcome, InterceptOutcome::Error);
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        reply.content_type.as_deref(),
        Some("text/html; charset=utf-8")
    );
    assert!(reply.body.contains("boom"));
    assert!(reply.body.contains("config.rhai"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unhandled_delegates_to_chain() {
    let app = App::new(
        r#"
        fn app(req, res, chain) {
            if req.path.starts_with("/static") {
                unhandled();
            }
            res.content_type = "text/plain";
            res.write("from script");
        }
        "#,
    );
    let dispatcher = app.dispatcher();

    let reply = get(&dispatcher, "/static/app.css").await;
    assert_eq!(reply.outcome, InterceptOutcome::Delegated);
    assert_eq!(reply.body, "hello from /static/app.css");

    let reply = get(&dispatcher, "/page").await;
    assert_eq!(reply.outcome, InterceptOutcome::EngineHandled);
    assert_eq!(reply.body, "from script");

    let stats = dispatcher.stats();
    assert_eq!(stats.delegated, 1);
    assert_eq!(stats.engine_handled, 1);
    assert_eq!(stats.passthrough, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_redeploy_swaps_in_new_scripts() {
    let app = App::new(r#"fn app(req, res) { res.write("v1"); }"#);
    let dispatcher = app.dispatcher();
    let mut events = dispatcher.manager().subscribe();

    assert_eq!(get(&dispatcher, "/").await.body, "v1");
    assert_eq!(get(&dispatcher, "/").await.body, "v1");

    app.write("config", r#"fn app(req, res) { res.write("v2"); }"#);
    assert_eq!(get(&dispatcher, "/").await.body, "v1");

    app.redeploy(10);
    assert_eq!(get(&dispatcher, "/").await.body, "v2");
    assert_eq!(dispatcher.manager().peek().unwrap().generation(), 2);

    let event = events.try_recv().unwrap();
    assert!(matches!(
        event.kind,
        LifecycleEventKind::Rebuilt {
            previous: 1,
            generation: 2
        }
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broken_redeploy_keeps_previous_engine() {
    let app = App::new(r#"fn app(req, res) { res.write("v1"); }"#);
    let dispatcher = app.dispatcher();
    assert_eq!(get(&dispatcher, "/").await.body, "v1");

    app.write("config", r#"fn app(req, res) { res.write("v2" }"#);
    app.redeploy(10);
    for _ in 0..3 {
        let reply = get(&dispatcher, "/").await;
        assert_eq!(reply.outcome, InterceptOutcome::EngineHandled);
        assert_eq!(reply.body, "v1");
    }
    assert_eq!(dispatcher.manager().peek().unwrap().generation(), 1);

    app.write("config", r#"fn app(req, res) { res.write("v3"); }"#);
    app.redeploy(20);
    assert_eq!(get(&dispatcher, "/").await.body, "v3");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_chain_invocation_is_an_error() {
    let app = App::new(
        r#"
        fn app(req, res, chain) {
            chain.run();
            chain.run();
        }
        "#,
    );
    let dispatcher = app.dispatcher();

    let reply = get(&dispatcher, "/").await;
    assert_eq!(reply.outcome, InterceptOutcome::Error);
    assert_eq!(reply.status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(reply.body.contains("more than once"));
    assert!(!reply.body.contains("hello from"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_map_return_value_is_written() {
    let app = App::new(
        r#"
        fn app(req) {
            #{
                status: 201,
                headers: #{ "x-kind": "map" },
                body: ["created ", req.method]
            }
        }
        "#,
    );
    let dispatcher = app.dispatcher();

    let reply = get(&dispatcher, "/items").await;
    assert_eq!(reply.outcome, InterceptOutcome::EngineHandled);
    assert_eq!(reply.status, StatusCode::CREATED);
    assert_eq!(reply.header.as_deref(), Some("map"));
    assert_eq!(reply.body, "created GET");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_edits_reach_chain() {
    let app = App::new(
        r#"
        fn app(req, res, chain) {
            req.set_header("x-user", "alice");
            req.set_param("lang", "fr");
            chain.run();
        }
        "#,
    );
    let dispatcher = app.dispatcher();

    let reply = get(&dispatcher, "/docs?lang=en").await;
    assert_eq!(reply.outcome, InterceptOutcome::EngineHandled);
    assert_eq!(reply.body, "hello from /docs?lang=fr as alice");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_modules_resolve_from_module_path() {
    let app = App::new(
        r#"
        fn app(req, res) {
            import "views" as views;
            res.write(views::greet("sluice"));
        }
        "#,
    );
    app.write("views", r#"fn greet(name) { `hi ${name}` }"#);
    let dispatcher = app.dispatcher();

    assert_eq!(get(&dispatcher, "/").await.body, "hi sluice");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_home_passes_requests_through() {
    let dir = tempfile::tempdir().unwrap();
    let config = InterceptConfig::new(dir.path().join("missing"));
    let manager = Arc::new(EngineLifecycleManager::with_rhai(config));
    manager.start();
    let dispatcher = InterceptDispatcher::new(manager);

    let reply = get(&dispatcher, "/anything").await;
    assert_eq!(reply.outcome, InterceptOutcome::Delegated);
    assert_eq!(reply.body, "hello from /anything");
    assert!(dispatcher.manager().is_disabled());
    assert_eq!(dispatcher.stats().passthrough, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dispatcher_wraps_next_as_middleware() {
    let app = App::new(
        r#"
        fn app(req, res, chain) {
            let buf = chain.capture();
            buf.status = 202;
            buf.body = "[" + buf.body + "]";
            buf
        }
        "#,
    );
    let dispatcher: Arc<dyn Middleware> = Arc::new(app.dispatcher());
    let stack: Arc<[Arc<dyn Middleware>]> = Arc::new([dispatcher]);
    let next = Next::with_handler(
        stack,
        handler_fn(|req: Request<Body>| async move {
            responses::ok().text(format!("handler {}", req.uri().path()))
        }),
    );

    let request = Request::builder()
        .uri("/mw")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = next.run(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/plain; charset=utf-8"
    );
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"[handler /mw]");
}
