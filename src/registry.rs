use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chrono::Duration as ChronoDuration;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::{debug, warn};
use url::Url;

use crate::clock::Clock;
use crate::error::{Result, StewardError};
use crate::model::{CheckStatus, ImageVersion};
use crate::store::ImageVersionStore;

const AUTH_JSON_REL_PATH: &str = ".config/containers/auth.json";
const DOCKER_CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
const REGISTRY_HTTP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryError {
    Timeout,
    Unauthorized,
    AuthParse,
    ChallengeParse,
    BadResponse,
    DigestMissing,
    Io,
    Json,
}

impl RegistryError {
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::Timeout => "timeout",
            RegistryError::Unauthorized => "unauthorized",
            RegistryError::AuthParse => "auth-parse",
            RegistryError::ChallengeParse => "challenge-parse",
            RegistryError::BadResponse => "bad-response",
            RegistryError::DigestMissing => "digest-missing",
            RegistryError::Io => "io-error",
            RegistryError::Json => "json-error",
        }
    }
}

/// Parsed image reference. `normalized` is `registry/repo:tag` without a
/// scheme and is the cache key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageRef {
    pub scheme: String,
    pub registry: String,
    pub repo: String,
    pub tag: String,
    pub normalized: String,
}

impl ImageRef {
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim();
        if raw.is_empty() {
            return Err(StewardError::InvalidImageRef(input.to_string()));
        }

        if raw.starts_with("http://") || raw.starts_with("https://") {
            let url =
                Url::parse(raw).map_err(|_| StewardError::InvalidImageRef(input.to_string()))?;
            let scheme = url.scheme().to_string();
            let host = url
                .host_str()
                .ok_or_else(|| StewardError::InvalidImageRef(input.to_string()))?
                .to_ascii_lowercase();
            let registry = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host,
            };
            let path = url.path().trim_start_matches('/');
            let (repo, tag) = split_repo_tag(path)
                .ok_or_else(|| StewardError::InvalidImageRef(input.to_string()))?;
            let normalized = format!("{registry}/{repo}:{tag}");
            return Ok(Self {
                scheme,
                registry,
                repo,
                tag,
                normalized,
            });
        }

        let (registry_raw, rest) = raw
            .split_once('/')
            .ok_or_else(|| StewardError::InvalidImageRef(input.to_string()))?;
        let registry = normalize_registry_host(registry_raw)
            .ok_or_else(|| StewardError::InvalidImageRef(input.to_string()))?;
        let (repo, tag) =
            split_repo_tag(rest).ok_or_else(|| StewardError::InvalidImageRef(input.to_string()))?;
        let normalized = format!("{registry}/{repo}:{tag}");
        Ok(Self {
            scheme: "https".to_string(),
            registry,
            repo,
            tag,
            normalized,
        })
    }
}

fn normalize_registry_host(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(
        trimmed
            .split('/')
            .next()
            .unwrap_or(trimmed)
            .to_ascii_lowercase(),
    )
}

fn split_repo_tag(path: &str) -> Option<(String, String)> {
    let trimmed = path.trim().trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }

    // The tag separator is the last ':' after the final path segment, so
    // registry ports are never mistaken for tags.
    let last_slash = trimmed.rfind('/').unwrap_or(0);
    let tag_sep = trimmed[last_slash..].rfind(':').map(|idx| idx + last_slash)?;

    let repo = trimmed[..tag_sep].trim().to_string();
    let tag = trimmed[tag_sep + 1..].trim().to_string();
    if repo.is_empty() || tag.is_empty() {
        return None;
    }
    Some((repo, tag))
}

#[async_trait]
pub trait RegistryClient: Send + Sync {
    async fn resolve_digest(&self, image: &ImageRef) -> std::result::Result<String, RegistryError>;
}

/// Registry client speaking the OCI distribution API: HEAD the manifest and
/// read `docker-content-digest`, negotiating basic or bearer auth from the
/// registry's challenge.
pub struct HttpRegistryClient {
    auth_path: Option<PathBuf>,
}

impl HttpRegistryClient {
    pub fn new(auth_path: Option<PathBuf>) -> Self {
        Self { auth_path }
    }

    fn http_client(&self) -> std::result::Result<Client, RegistryError> {
        Client::builder()
            .timeout(REGISTRY_HTTP_TIMEOUT)
            .pool_max_idle_per_host(0)
            .build()
            .map_err(|_| RegistryError::BadResponse)
    }

    fn credentials_for(&self, registry: &str) -> std::result::Result<Option<BasicCredentials>, RegistryError> {
        let path = match &self.auth_path {
            Some(path) => path.clone(),
            None => {
                let home = env::var("HOME").map_err(|_| RegistryError::Io)?;
                Path::new(&home).join(AUTH_JSON_REL_PATH)
            }
        };
        let auths = load_auth_json(&path)?;
        Ok(auths.get(registry).cloned())
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn resolve_digest(&self, image: &ImageRef) -> std::result::Result<String, RegistryError> {
        let client = self.http_client()?;
        let manifest_url = format!(
            "{}://{}/v2/{}/manifests/{}",
            image.scheme, image.registry, image.repo, image.tag
        );

        let response = client
            .head(&manifest_url)
            .headers(manifest_accept_headers())
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if response.status().is_success() {
            return read_digest_header(response.headers());
        }
        if response.status() != StatusCode::UNAUTHORIZED {
            return Err(map_status_to_error(response.status()));
        }

        let challenges: Vec<String> = response
            .headers()
            .get_all(reqwest::header::WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| v.to_string())
            .collect();

        let creds = self.credentials_for(&image.registry)?;

        if let Some(challenge) = challenges
            .iter()
            .find(|h| h.trim_start().to_ascii_lowercase().starts_with("bearer "))
        {
            let bearer = parse_www_authenticate_bearer(challenge)?;
            // Public repositories hand out anonymous tokens; credentials are
            // attached only when configured for this registry.
            let token = fetch_bearer_token(&client, &bearer, creds.as_ref()).await?;
            let retry = client
                .head(&manifest_url)
                .headers(manifest_accept_headers())
                .bearer_auth(token)
                .send()
                .await
                .map_err(map_reqwest_error)?;
            if retry.status().is_success() {
                return read_digest_header(retry.headers());
            }
            return Err(map_status_to_error(retry.status()));
        }

        if challenges
            .iter()
            .any(|h| h.trim_start().to_ascii_lowercase().starts_with("basic "))
        {
            let creds = creds.ok_or(RegistryError::Unauthorized)?;
            let retry = client
                .head(&manifest_url)
                .headers(manifest_accept_headers())
                .basic_auth(&creds.username, Some(&creds.password))
                .send()
                .await
                .map_err(map_reqwest_error)?;
            if retry.status().is_success() {
                return read_digest_header(retry.headers());
            }
            return Err(map_status_to_error(retry.status()));
        }

        Err(RegistryError::Unauthorized)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> RegistryError {
    if err.is_timeout() {
        return RegistryError::Timeout;
    }
    RegistryError::BadResponse
}

fn map_status_to_error(status: StatusCode) -> RegistryError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return RegistryError::Unauthorized;
    }
    RegistryError::BadResponse
}

fn manifest_accept_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    let accept = "application/vnd.oci.image.manifest.v1+json, application/vnd.oci.image.index.v1+json, application/vnd.docker.distribution.manifest.v2+json, application/vnd.docker.distribution.manifest.list.v2+json";
    headers.insert(
        reqwest::header::ACCEPT,
        HeaderValue::from_str(accept).unwrap_or_else(|_| HeaderValue::from_static("*/*")),
    );
    headers
}

fn read_digest_header(headers: &HeaderMap) -> std::result::Result<String, RegistryError> {
    headers
        .get(DOCKER_CONTENT_DIGEST_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(RegistryError::DigestMissing)
}

#[derive(Clone, Debug)]
struct BearerChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

#[derive(Clone, Debug)]
struct BasicCredentials {
    username: String,
    password: String,
}

fn parse_www_authenticate_bearer(header: &str) -> std::result::Result<BearerChallenge, RegistryError> {
    let rest = header
        .trim()
        .splitn(2, ' ')
        .nth(1)
        .unwrap_or("")
        .trim()
        .to_string();

    let params = parse_auth_params(&rest);
    let realm = params
        .get("realm")
        .cloned()
        .filter(|v| !v.is_empty())
        .ok_or(RegistryError::ChallengeParse)?;

    Ok(BearerChallenge {
        realm,
        service: params.get("service").cloned().filter(|v| !v.is_empty()),
        scope: params.get("scope").cloned().filter(|v| !v.is_empty()),
    })
}

fn parse_auth_params(input: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for raw in input.split(',') {
        let part = raw.trim();
        if part.is_empty() {
            continue;
        }
        let Some((k, v)) = part.split_once('=') else {
            continue;
        };
        let key = k.trim().to_ascii_lowercase();
        let mut value = v.trim().to_string();
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        out.insert(key, value);
    }
    out
}

async fn fetch_bearer_token(
    client: &Client,
    challenge: &BearerChallenge,
    creds: Option<&BasicCredentials>,
) -> std::result::Result<String, RegistryError> {
    let mut url = Url::parse(&challenge.realm).map_err(|_| RegistryError::ChallengeParse)?;
    {
        let mut query = url.query_pairs_mut();
        if let Some(service) = &challenge.service {
            query.append_pair("service", service);
        }
        if let Some(scope) = &challenge.scope {
            query.append_pair("scope", scope);
        }
    }

    let mut request = client.get(url);
    if let Some(creds) = creds {
        request = request.basic_auth(&creds.username, Some(&creds.password));
    }
    let response = request.send().await.map_err(map_reqwest_error)?;

    if !response.status().is_success() {
        return Err(map_status_to_error(response.status()));
    }

    let body: Value = response.json().await.map_err(|_| RegistryError::Json)?;
    body.get("token")
        .and_then(|v| v.as_str())
        .or_else(|| body.get("access_token").and_then(|v| v.as_str()))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or(RegistryError::BadResponse)
}

fn load_auth_json(
    path: &Path,
) -> std::result::Result<HashMap<String, BasicCredentials>, RegistryError> {
    let raw = match fs::read_to_string(path) {
        Ok(v) => v,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(_) => return Err(RegistryError::Io),
    };

    let json: Value = serde_json::from_str(&raw).map_err(|_| RegistryError::AuthParse)?;
    let mut out = HashMap::new();
    let Some(auths) = json.get("auths").and_then(|v| v.as_object()) else {
        return Ok(out);
    };

    for (key, entry) in auths {
        let Some(registry) = normalize_registry_host(key) else {
            continue;
        };
        let Some(obj) = entry.as_object() else {
            continue;
        };

        if let Some(auth) = obj.get("auth").and_then(|v| v.as_str()).map(str::trim) {
            if let Ok(decoded) = BASE64_STANDARD.decode(auth.as_bytes()) {
                if let Ok(decoded_str) = String::from_utf8(decoded) {
                    if let Some((user, pass)) = decoded_str.split_once(':') {
                        if !user.is_empty() {
                            out.insert(
                                registry,
                                BasicCredentials {
                                    username: user.to_string(),
                                    password: pass.to_string(),
                                },
                            );
                            continue;
                        }
                    }
                }
            }
        }

        let username = obj
            .get("username")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        let password = obj
            .get("password")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty());
        if let (Some(username), Some(password)) = (username, password) {
            out.insert(
                registry,
                BasicCredentials {
                    username: username.to_string(),
                    password: password.to_string(),
                },
            );
        }
    }

    Ok(out)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedDigest {
    pub digest: String,
    pub from_cache: bool,
}

/// Digest lookups through the ImageVersion cache. Fresh `ok` rows are served
/// from cache; anything else falls through to the registry client. Failed
/// refreshes are cached with the previous digest retained so operators can
/// still see the last known state.
pub struct DigestResolver {
    store: Arc<dyn ImageVersionStore>,
    client: Arc<dyn RegistryClient>,
    clock: Arc<dyn Clock>,
    ttl_secs: u64,
}

impl DigestResolver {
    pub fn new(
        store: Arc<dyn ImageVersionStore>,
        client: Arc<dyn RegistryClient>,
        clock: Arc<dyn Clock>,
        ttl_secs: u64,
    ) -> Self {
        Self {
            store,
            client,
            clock,
            ttl_secs,
        }
    }

    pub async fn resolve(&self, raw: &str, force_refresh: bool) -> Result<ResolvedDigest> {
        let image = ImageRef::parse(raw)?;
        let now = self.clock.now();

        let cached = self.store.get(&image.normalized).await?;
        if !force_refresh {
            if let Some(row) = &cached {
                let fresh = now - row.checked_at <= ChronoDuration::seconds(self.ttl_secs as i64);
                if fresh && row.status == CheckStatus::Ok {
                    if let Some(digest) = &row.digest {
                        debug!(image = %image.normalized, "digest cache hit");
                        return Ok(ResolvedDigest {
                            digest: digest.clone(),
                            from_cache: true,
                        });
                    }
                }
            }
        }

        match self.client.resolve_digest(&image).await {
            Ok(digest) => {
                let row = ImageVersion {
                    image: image.normalized.clone(),
                    registry: image.registry.clone(),
                    tag: image.tag.clone(),
                    digest: Some(digest.clone()),
                    is_latest: cached.as_ref().map(|c| c.is_latest).unwrap_or(false),
                    status: CheckStatus::Ok,
                    error: None,
                    checked_at: now,
                };
                if let Err(err) = self.store.upsert(&row).await {
                    warn!(image = %image.normalized, %err, "digest cache upsert failed");
                }
                Ok(ResolvedDigest {
                    digest,
                    from_cache: false,
                })
            }
            Err(err) => {
                let row = ImageVersion {
                    image: image.normalized.clone(),
                    registry: image.registry.clone(),
                    tag: image.tag.clone(),
                    digest: cached.as_ref().and_then(|c| c.digest.clone()),
                    is_latest: cached.as_ref().map(|c| c.is_latest).unwrap_or(false),
                    status: CheckStatus::Error,
                    error: Some(err.code().to_string()),
                    checked_at: now,
                };
                if let Err(store_err) = self.store.upsert(&row).await {
                    warn!(image = %image.normalized, %store_err, "digest cache upsert failed");
                }
                Err(StewardError::RegistryUnreachable {
                    image: image.normalized,
                    reason: err.code().to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{Stores, open_memory_pool};
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[test]
    fn parses_plain_and_url_refs() {
        let plain = ImageRef::parse("ghcr.io/example/app:main").unwrap();
        assert_eq!(plain.scheme, "https");
        assert_eq!(plain.registry, "ghcr.io");
        assert_eq!(plain.repo, "example/app");
        assert_eq!(plain.tag, "main");
        assert_eq!(plain.normalized, "ghcr.io/example/app:main");

        let url = ImageRef::parse("http://localhost:5000/team/svc:1.2.3").unwrap();
        assert_eq!(url.scheme, "http");
        assert_eq!(url.registry, "localhost:5000");
        assert_eq!(url.normalized, "localhost:5000/team/svc:1.2.3");
    }

    #[test]
    fn registry_port_is_not_a_tag() {
        let parsed = ImageRef::parse("Registry.Example.com/ns/app:v1").unwrap();
        assert_eq!(parsed.registry, "registry.example.com");
        assert_eq!(parsed.tag, "v1");
    }

    #[test]
    fn rejects_invalid_refs() {
        for raw in ["", "   ", "no-registry", "ghcr.io/app", "ghcr.io/:tag"] {
            assert!(
                matches!(ImageRef::parse(raw), Err(StewardError::InvalidImageRef(_))),
                "expected rejection for {raw:?}"
            );
        }
    }

    #[test]
    fn bearer_challenge_parsing() {
        let challenge = parse_www_authenticate_bearer(
            "Bearer realm=\"https://ghcr.io/token\",service=\"ghcr.io\",scope=\"repository:example/app:pull\"",
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://ghcr.io/token");
        assert_eq!(challenge.service.as_deref(), Some("ghcr.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:example/app:pull")
        );

        assert_eq!(
            parse_www_authenticate_bearer("Bearer service=\"x\"").unwrap_err(),
            RegistryError::ChallengeParse
        );
    }

    #[test]
    fn auth_json_loading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("auth.json");
        let encoded = BASE64_STANDARD.encode("robot:hunter2");
        fs::write(
            &path,
            format!(
                r#"{{"auths":{{"ghcr.io":{{"auth":"{encoded}"}},"registry.example.com":{{"username":"svc","password":"pw"}}}}}}"#
            ),
        )
        .unwrap();

        let auths = load_auth_json(&path).unwrap();
        assert_eq!(auths.get("ghcr.io").unwrap().username, "robot");
        assert_eq!(auths.get("ghcr.io").unwrap().password, "hunter2");
        assert_eq!(auths.get("registry.example.com").unwrap().username, "svc");

        // Missing file is "no credentials", not an error.
        assert!(load_auth_json(&dir.path().join("absent.json"))
            .unwrap()
            .is_empty());
    }

    struct ScriptedClient {
        responses: Mutex<Vec<std::result::Result<String, RegistryError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedClient {
        fn new(responses: Vec<std::result::Result<String, RegistryError>>) -> Self {
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl RegistryClient for ScriptedClient {
        async fn resolve_digest(
            &self,
            _image: &ImageRef,
        ) -> std::result::Result<String, RegistryError> {
            *self.calls.lock().unwrap() += 1;
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Err(RegistryError::BadResponse);
            }
            responses.remove(0)
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::at(
            chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn fresh_cache_rows_short_circuit_the_registry() {
        let stores = Stores::sqlite(open_memory_pool().await.unwrap());
        let client = Arc::new(ScriptedClient::new(vec![Ok("sha256:aaa".into())]));
        let clock = clock();
        let resolver = DigestResolver::new(
            stores.image_versions.clone(),
            client.clone(),
            clock.clone(),
            600,
        );

        let first = resolver
            .resolve("ghcr.io/example/app:main", false)
            .await
            .unwrap();
        assert!(!first.from_cache);
        assert_eq!(first.digest, "sha256:aaa");

        let second = resolver
            .resolve("ghcr.io/example/app:main", false)
            .await
            .unwrap();
        assert!(second.from_cache);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn expired_rows_are_cache_misses() {
        let stores = Stores::sqlite(open_memory_pool().await.unwrap());
        let client = Arc::new(ScriptedClient::new(vec![
            Ok("sha256:aaa".into()),
            Ok("sha256:bbb".into()),
        ]));
        let clock = clock();
        let resolver = DigestResolver::new(
            stores.image_versions.clone(),
            client.clone(),
            clock.clone(),
            600,
        );

        resolver
            .resolve("ghcr.io/example/app:main", false)
            .await
            .unwrap();
        clock.advance(ChronoDuration::seconds(601));
        let refreshed = resolver
            .resolve("ghcr.io/example/app:main", false)
            .await
            .unwrap();
        assert!(!refreshed.from_cache);
        assert_eq!(refreshed.digest, "sha256:bbb");
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_retains_previous_digest_in_cache() {
        let stores = Stores::sqlite(open_memory_pool().await.unwrap());
        let client = Arc::new(ScriptedClient::new(vec![
            Ok("sha256:aaa".into()),
            Err(RegistryError::Timeout),
        ]));
        let clock = clock();
        let resolver = DigestResolver::new(
            stores.image_versions.clone(),
            client.clone(),
            clock.clone(),
            600,
        );

        resolver
            .resolve("ghcr.io/example/app:main", false)
            .await
            .unwrap();
        clock.advance(ChronoDuration::seconds(601));

        let err = resolver
            .resolve("ghcr.io/example/app:main", false)
            .await
            .unwrap_err();
        assert!(matches!(err, StewardError::RegistryUnreachable { .. }));

        let row = stores
            .image_versions
            .get("ghcr.io/example/app:main")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, CheckStatus::Error);
        assert_eq!(row.digest.as_deref(), Some("sha256:aaa"));
        assert_eq!(row.error.as_deref(), Some("timeout"));
    }

    #[tokio::test]
    async fn force_refresh_bypasses_fresh_cache() {
        let stores = Stores::sqlite(open_memory_pool().await.unwrap());
        let client = Arc::new(ScriptedClient::new(vec![
            Ok("sha256:aaa".into()),
            Ok("sha256:bbb".into()),
        ]));
        let resolver = DigestResolver::new(
            stores.image_versions.clone(),
            client.clone(),
            clock(),
            600,
        );

        resolver
            .resolve("ghcr.io/example/app:main", false)
            .await
            .unwrap();
        let forced = resolver
            .resolve("ghcr.io/example/app:main", true)
            .await
            .unwrap();
        assert!(!forced.from_cache);
        assert_eq!(forced.digest, "sha256:bbb");
    }
}
