use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{Path, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::assets;
use crate::config::{check_config, expand_home_dir, lookup_uid_gid, ConfigError, Options};
use crate::exec;
use crate::lifecycle::Lifecycle;
use crate::session;
use crate::title::TitleTemplate;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const URL_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h',
    'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// The assembled server: configuration, resolved child credentials, compiled
/// title template, and the shared lifecycle state.
#[derive(Debug)]
pub struct App {
    pub command: Vec<String>,
    pub options: Options,
    pub run_as: Option<(u32, u32)>,
    pub title: TitleTemplate,
    pub hostname: String,
    /// Random base-36 segment prefixed to every route, or empty.
    pub path_prefix: String,
    pub lifecycle: Arc<Lifecycle>,
    server_handle: Handle,
}

impl App {
    pub fn new(command: Vec<String>, options: Options) -> Result<Arc<Self>, ConfigError> {
        check_config(&options)?;
        let title = TitleTemplate::parse(&options.title_format)?;
        let run_as = lookup_uid_gid(&options.run_as_user);
        let path_prefix = if options.enable_random_url {
            format!("/{}", random_url(options.random_url_length))
        } else {
            String::new()
        };
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        Ok(Arc::new(Self {
            command,
            options,
            run_as,
            title,
            hostname,
            path_prefix,
            lifecycle: Lifecycle::new(),
            server_handle: Handle::new(),
        }))
    }

    pub fn server_handle(&self) -> Handle {
        self.server_handle.clone()
    }

    /// The bound address once the listener is up. Useful with port 0.
    pub async fn listening_addr(&self) -> Option<SocketAddr> {
        self.server_handle.listening().await
    }

    /// Bind, serve until graceful shutdown completes, then drain remaining
    /// sessions. Returns an error for bind or TLS failures.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        let options = &self.options;
        info!(
            signal = options.close_signal,
            "close signal will be sent to the command process on session teardown"
        );
        if options.permit_write {
            info!("permitting clients to write input to the pty");
        }
        if options.once {
            info!("once option is provided, accepting only one client");
        }

        let host = if options.address.is_empty() {
            "0.0.0.0".to_string()
        } else {
            options.address.clone()
        };
        let addr: SocketAddr = format!("{host}:{}", options.port)
            .parse()
            .with_context(|| format!("invalid listen address {host}:{}", options.port))?;

        let scheme = if options.enable_tls { "https" } else { "http" };
        info!(command = %self.command.join(" "), "server is starting");
        if options.address.is_empty() {
            for address in list_addresses() {
                info!(
                    "URL: {scheme}://{}:{}{}/",
                    format_host(&address),
                    options.port,
                    self.path_prefix
                );
            }
        } else {
            info!(
                "URL: {scheme}://{}:{}{}/",
                format_host(&options.address),
                options.port,
                self.path_prefix
            );
        }

        if options.timeout > 0 {
            self.lifecycle
                .arm_idle_timer(Duration::from_secs(options.timeout));
        }

        // Close the accept gate when an exit is requested; sessions already
        // upgraded keep their connections until they finish.
        {
            let lifecycle = Arc::clone(&self.lifecycle);
            let handle = self.server_handle.clone();
            tokio::spawn(async move {
                lifecycle.shutdown_requested().await;
                handle.graceful_shutdown(None);
            });
        }

        let service = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        if options.enable_tls {
            let tls = self.tls_config().await?;
            axum_server::bind_rustls(addr, tls)
                .handle(self.server_handle.clone())
                .serve(service)
                .await
                .context("server error")?;
        } else {
            axum_server::bind(addr)
                .handle(self.server_handle.clone())
                .serve(service)
                .await
                .context("server error")?;
        }

        self.lifecycle.wait_idle().await;
        info!("exiting");
        Ok(())
    }

    /// Route table. The basic-auth wrapper covers the site routes only; the
    /// session endpoint authenticates through the init token instead.
    pub fn router(self: &Arc<Self>) -> Router {
        let mut site: Router<Arc<App>> = Router::new();
        site = if self.options.index_file.is_empty() {
            site.route("/", get(handle_index))
        } else {
            info!(path = %self.options.index_file, "using custom index file");
            site.route("/", get(handle_custom_index))
        };
        site = site
            .route("/auth_token.js", get(handle_auth_token))
            .route("/js/{*path}", get(handle_js_asset))
            .route("/favicon.png", get(handle_favicon))
            .route("/rexec", any(exec::handle_rexec));
        if self.options.enable_basic_auth {
            info!("using basic authentication");
            site = site.layer(middleware::from_fn_with_state(
                Arc::clone(self),
                basic_auth,
            ));
        }

        let mut router = site.route("/ws", get(session::handle_ws));
        if !self.path_prefix.is_empty() {
            router = Router::new().nest(&self.path_prefix, router);
        }

        let server_header =
            HeaderValue::from_str(&format!("GoTTY/{VERSION}")).expect("valid header value");
        router
            .layer(
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any),
            )
            .layer(SetResponseHeaderLayer::overriding(
                header::SERVER,
                server_header,
            ))
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(self))
    }

    async fn tls_config(&self) -> anyhow::Result<RustlsConfig> {
        let crt_path = expand_home_dir(&self.options.tls_crt_file);
        let key_path = expand_home_dir(&self.options.tls_key_file);
        if !self.options.enable_tls_client_auth {
            return RustlsConfig::from_pem_file(&crt_path, &key_path)
                .await
                .with_context(|| {
                    format!("failed to load TLS key pair ({crt_path}, {key_path})")
                });
        }

        let ca_path = expand_home_dir(&self.options.tls_ca_crt_file);
        let ca_pem = tokio::fs::read(&ca_path)
            .await
            .with_context(|| format!("could not open CA crt file {ca_path}"))?;
        let mut roots = rustls::RootCertStore::empty();
        let mut parsed = 0usize;
        for cert in rustls_pemfile::certs(&mut BufReader::new(ca_pem.as_slice())) {
            let cert = cert.with_context(|| format!("could not parse CA crt file data in {ca_path}"))?;
            roots
                .add(cert)
                .with_context(|| format!("could not load CA certificate from {ca_path}"))?;
            parsed += 1;
        }
        if parsed == 0 {
            anyhow::bail!("could not parse CA crt file data in {ca_path}");
        }
        let verifier = rustls::server::WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("failed to build client certificate verifier")?;

        let crt_pem = tokio::fs::read(&crt_path)
            .await
            .with_context(|| format!("failed to read TLS cert {crt_path}"))?;
        let certs = rustls_pemfile::certs(&mut BufReader::new(crt_pem.as_slice()))
            .collect::<std::io::Result<Vec<_>>>()
            .with_context(|| format!("failed to parse TLS cert {crt_path}"))?;
        let key_pem = tokio::fs::read(&key_path)
            .await
            .with_context(|| format!("failed to read TLS key {key_path}"))?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))
            .with_context(|| format!("failed to parse TLS key {key_path}"))?
            .with_context(|| format!("no private key found in {key_path}"))?;

        let config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(certs, key)
            .context("invalid TLS certificate")?;
        Ok(RustlsConfig::from_config(Arc::new(config)))
    }
}

async fn handle_index() -> Response {
    serve_asset("index.html")
}

async fn handle_favicon() -> Response {
    serve_asset("favicon.png")
}

async fn handle_js_asset(Path(path): Path<String>) -> Response {
    serve_asset(&format!("js/{path}"))
}

fn serve_asset(path: &str) -> Response {
    match assets::open(path) {
        Some((body, content_type)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn handle_custom_index(State(app): State<Arc<App>>) -> Response {
    let path = expand_home_dir(&app.options.index_file);
    match tokio::fs::read(&path).await {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            debug!(path = %path, error = %e, "failed to read index file");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Declares the credential for the front-end to echo back in its init frame.
async fn handle_auth_token(State(app): State<Arc<App>>) -> Response {
    (
        [(header::CONTENT_TYPE, "application/javascript")],
        format!("var gotty_auth_token = \"{}\";", app.options.credential),
    )
        .into_response()
}

async fn basic_auth(State(app): State<Arc<App>>, request: Request, next: Next) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    let mut parts = authorization.splitn(2, ' ');
    let scheme = parts.next().unwrap_or_default();
    let payload = parts.next().unwrap_or_default();
    if !scheme.eq_ignore_ascii_case("basic") {
        return challenge("Bad Request");
    }
    let decoded = match BASE64.decode(payload) {
        Ok(decoded) => decoded,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };
    if decoded != app.options.credential.as_bytes() {
        return challenge("authorization failed");
    }
    if let Some(ConnectInfo(remote)) = request.extensions().get::<ConnectInfo<SocketAddr>>() {
        debug!(remote = %remote, "basic authentication succeeded");
    }
    next.run(request).await
}

fn challenge(body: &'static str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Basic realm=\"GoTTY\"")],
        body,
    )
        .into_response()
}

fn random_url(length: usize) -> String {
    nanoid::nanoid!(length, &URL_ALPHABET)
}

/// Addresses of every local interface, for the startup URL banner.
fn list_addresses() -> Vec<String> {
    match nix::ifaddrs::getifaddrs() {
        Ok(interfaces) => interfaces
            .filter_map(|interface| {
                let address = interface.address?;
                if let Some(v4) = address.as_sockaddr_in() {
                    Some(v4.ip().to_string())
                } else {
                    address.as_sockaddr_in6().map(|v6| v6.ip().to_string())
                }
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

fn format_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_url_has_requested_length_and_alphabet() {
        for length in [1, 8, 32] {
            let url = random_url(length);
            assert_eq!(url.len(), length);
            assert!(url.chars().all(|c| URL_ALPHABET.contains(&c)));
        }
    }

    #[test]
    fn format_host_brackets_ipv6_only() {
        assert_eq!(format_host("127.0.0.1"), "127.0.0.1");
        assert_eq!(format_host("::1"), "[::1]");
        assert_eq!(format_host("[::1]"), "[::1]");
    }

    #[test]
    fn app_new_rejects_bad_title_templates() {
        let mut options = Options::default();
        options.title_format = "{{bogus}}".to_string();
        let err = App::new(vec!["cat".to_string()], options).expect_err("must fail");
        assert!(matches!(err, ConfigError::TitleFormat(_)));
    }

    #[test]
    fn app_new_applies_random_url_prefix() {
        let mut options = Options::default();
        options.enable_random_url = true;
        options.random_url_length = 6;
        let app = App::new(vec!["cat".to_string()], options).expect("app");
        assert_eq!(app.path_prefix.len(), 7);
        assert!(app.path_prefix.starts_with('/'));
    }
}
