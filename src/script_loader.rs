use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use mlua::{HookTriggers, Lua, LuaOptions, StdLib, VmState};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Cached sources are trusted for 24 hours.
const CACHE_TTL_MS: i64 = 24 * 60 * 60 * 1000;
/// Isolate memory ceiling. Extraction tables are tiny; anything near this is
/// a hostile source.
const ISOLATE_MEMORY_LIMIT: usize = 64 * 1024 * 1024;
/// Wall-clock budget for one `execute` call, enforced from an instruction
/// hook so a busy loop in remote source cannot stall the caller.
const EXEC_BUDGET: Duration = Duration::from_millis(1000);
const HOOK_INSTRUCTION_INTERVAL: u32 = 10_000;

#[derive(Debug, Error)]
pub enum FetchFailure {
    #[error("transport security failure: {0}")]
    Tls(String),
    #[error("{0}")]
    Other(String),
}

/// Fetches one source file by URL. The production implementation is an HTTP
/// client; tests substitute a stub so cache and fallback logic run offline.
pub trait SourceFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, FetchFailure>>;
}

/// `reqwest`-backed fetcher with a bounded request timeout.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self, ScriptLoaderError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ScriptLoaderError::FetchFailed(e.to_string()))?;
        Ok(HttpFetcher { client })
    }
}

impl SourceFetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, FetchFailure>> {
        Box::pin(async move {
            let classify = |e: reqwest::Error| {
                let text = e.to_string();
                let lowered = text.to_lowercase();
                if lowered.contains("certificate") || lowered.contains("tls") {
                    FetchFailure::Tls(text)
                } else {
                    FetchFailure::Other(text)
                }
            };
            let response = self.client.get(url).send().await.map_err(classify)?;
            let status = response.status();
            if !status.is_success() {
                return Err(FetchFailure::Other(format!("{url}: http {status}")));
            }
            response.text().await.map_err(classify)
        })
    }
}

#[derive(Debug, Error)]
pub enum ScriptLoaderError {
    #[error("both source urls exhausted: {0}")]
    FetchFailed(String),
    #[error("cache file corrupt: {0}")]
    CacheCorrupt(String),
    #[error("script isolate crashed: {0}")]
    IsolateCrashed(String),
}

#[derive(Debug, Clone)]
pub struct ScriptLoaderConfig {
    pub primary_url: String,
    pub fallback_url: Option<String>,
    pub cache_dir: PathBuf,
    pub allow_cache: bool,
    pub allow_insecure: bool,
}

/// Loads one remote extraction source, caches it for 24 h, and evaluates
/// short expressions against it inside a sandboxed Lua isolate.
///
/// Readiness is the successful return of [`ScriptLoader::load`] — callers
/// await the constructor instead of a separate one-shot signal. The isolate
/// has no io, os, or network bindings; a syntax or runtime error in the
/// loaded source or in an expression becomes a text value, never a crash.
#[derive(Debug)]
pub struct ScriptLoader {
    lua: Lua,
    source_error: Option<String>,
}

impl ScriptLoader {
    pub async fn load(
        config: &ScriptLoaderConfig,
        fetcher: &dyn SourceFetcher,
    ) -> Result<Self, ScriptLoaderError> {
        let source = load_source(config, fetcher).await?;
        Self::from_source(&source)
    }

    /// Build the isolate directly from source text (cache layer bypassed).
    pub fn from_source(source: &str) -> Result<Self, ScriptLoaderError> {
        let lua = Lua::new_with(
            StdLib::MATH | StdLib::STRING | StdLib::TABLE,
            LuaOptions::default(),
        )
        .map_err(|e| ScriptLoaderError::IsolateCrashed(e.to_string()))?;
        lua.set_memory_limit(ISOLATE_MEMORY_LIMIT)
            .map_err(|e| ScriptLoaderError::IsolateCrashed(e.to_string()))?;

        let source_error =
            match with_budget(&lua, || lua.load(source).set_name("extractor source").exec()) {
                Ok(()) => None,
                Err(e) => {
                    warn!("extractor source failed to load: {e}");
                    Some(e.to_string())
                }
            };

        Ok(ScriptLoader { lua, source_error })
    }

    /// Evaluate `expression` with the loaded source's globals in scope.
    /// Script-level failures are returned as text values; only the isolate
    /// itself dying is an error.
    pub fn execute(&self, expression: &str) -> Result<serde_json::Value, ScriptLoaderError> {
        let chunk = format!("return ({expression})");
        let evaluated = with_budget(&self.lua, || {
            self.lua
                .load(&chunk)
                .set_name("extractor expression")
                .eval::<mlua::Value>()
        });
        match evaluated {
            Ok(value) => serde_json::to_value(&value)
                .map_err(|e| ScriptLoaderError::IsolateCrashed(e.to_string())),
            Err(mlua::Error::MemoryError(e)) => Err(ScriptLoaderError::IsolateCrashed(e)),
            Err(e) => {
                // A throw becomes the returned value, serialized as text.
                let mut text = e.to_string();
                if let Some(source_error) = &self.source_error {
                    text = format!("{text} (source load error: {source_error})");
                }
                Ok(serde_json::Value::String(text))
            }
        }
    }

    /// Release the isolate.
    pub fn terminate(self) {
        drop(self.lua);
    }
}

fn with_budget<T, F>(lua: &Lua, f: F) -> mlua::Result<T>
where
    F: FnOnce() -> mlua::Result<T>,
{
    let started = Instant::now();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INSTRUCTION_INTERVAL),
        move |_lua, _debug| {
            if started.elapsed() >= EXEC_BUDGET {
                return Err(mlua::Error::RuntimeError(format!(
                    "execution budget exceeded ({}ms)",
                    EXEC_BUDGET.as_millis()
                )));
            }
            Ok(VmState::Continue)
        },
    );
    let out = f();
    lua.remove_hook();
    out
}

fn cache_path(config: &ScriptLoaderConfig) -> PathBuf {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    config.primary_url.hash(&mut hasher);
    config.cache_dir.join(format!("{:016x}.src", hasher.finish()))
}

/// Newlines collapse to spaces so the cache stays a two-line record.
fn minify(source: &str) -> String {
    source.replace(['\r', '\n'], " ")
}

fn read_cache(path: &Path) -> Result<Option<String>, ScriptLoaderError> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(ScriptLoaderError::CacheCorrupt(e.to_string())),
    };
    let mut lines = text.splitn(2, '\n');
    let stamp_line = lines.next().unwrap_or("");
    let stamp: i64 = stamp_line.trim().parse().map_err(|_| {
        ScriptLoaderError::CacheCorrupt(format!("invalid timestamp line {stamp_line:?}"))
    })?;
    let age = chrono::Utc::now().timestamp_millis() - stamp;
    if !(0..CACHE_TTL_MS).contains(&age) {
        debug!("cache {} expired ({age}ms old)", path.display());
        return Ok(None);
    }
    match lines.next() {
        Some(source) => Ok(Some(source.to_string())),
        None => Err(ScriptLoaderError::CacheCorrupt("missing source line".into())),
    }
}

fn write_cache(path: &Path, source: &str) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!("cannot create cache dir {}: {e}", parent.display());
            return;
        }
    }
    let record = format!("{}\n{}", chrono::Utc::now().timestamp_millis(), source);
    if let Err(e) = std::fs::write(path, record) {
        warn!("cannot write cache {}: {e}", path.display());
    }
}

async fn fetch_with_downgrade(
    url: &str,
    allow_insecure: bool,
    fetcher: &dyn SourceFetcher,
) -> Result<String, FetchFailure> {
    match fetcher.fetch(url).await {
        Ok(source) => Ok(source),
        Err(FetchFailure::Tls(reason)) if allow_insecure && url.starts_with("https://") => {
            let downgraded = format!("http://{}", &url["https://".len()..]);
            warn!("tls failure on {url} ({reason}); retrying insecurely");
            fetcher.fetch(&downgraded).await
        }
        Err(e) => Err(e),
    }
}

async fn load_source(
    config: &ScriptLoaderConfig,
    fetcher: &dyn SourceFetcher,
) -> Result<String, ScriptLoaderError> {
    let path = cache_path(config);
    if config.allow_cache {
        match read_cache(&path) {
            Ok(Some(source)) => {
                debug!("using cached source for {}", config.primary_url);
                return Ok(source);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("{e}; deleting cache and refetching");
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    let primary = fetch_with_downgrade(&config.primary_url, config.allow_insecure, fetcher).await;
    let source = match primary {
        Ok(source) => source,
        Err(primary_err) => {
            let Some(fallback_url) = &config.fallback_url else {
                return Err(ScriptLoaderError::FetchFailed(primary_err.to_string()));
            };
            info!(
                "primary source {} failed ({primary_err}); trying fallback",
                config.primary_url
            );
            fetch_with_downgrade(fallback_url, config.allow_insecure, fetcher)
                .await
                .map_err(|fallback_err| {
                    ScriptLoaderError::FetchFailed(format!(
                        "primary: {primary_err}; fallback: {fallback_err}"
                    ))
                })?
        }
    };

    let source = minify(&source);
    if config.allow_cache {
        write_cache(&path, &source);
    }
    Ok(source)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct StubFetcher {
        responses: HashMap<String, Result<String, FetchFailure>>,
        calls: Mutex<Vec<String>>,
    }

    impl StubFetcher {
        fn new(responses: Vec<(&str, Result<String, FetchFailure>)>) -> Self {
            StubFetcher {
                responses: responses
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v))
                    .collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl SourceFetcher for StubFetcher {
        fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<String, FetchFailure>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(url.to_string());
                match self.responses.get(url) {
                    Some(Ok(source)) => Ok(source.clone()),
                    Some(Err(FetchFailure::Tls(t))) => Err(FetchFailure::Tls(t.clone())),
                    Some(Err(FetchFailure::Other(t))) => Err(FetchFailure::Other(t.clone())),
                    None => Err(FetchFailure::Other("no response".into())),
                }
            })
        }
    }

    fn temp_cache_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("pixsim-loader-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn config(tag: &str) -> ScriptLoaderConfig {
        ScriptLoaderConfig {
            primary_url: format!("https://example.test/{tag}.lua"),
            fallback_url: Some(format!("https://fallback.test/{tag}.lua")),
            cache_dir: temp_cache_dir(tag),
            allow_cache: true,
            allow_insecure: false,
        }
    }

    #[tokio::test]
    async fn fetches_and_rewrites_cache() {
        let cfg = config("fetch");
        let fetcher = StubFetcher::new(vec![(
            cfg.primary_url.as_str(),
            Ok("ids = { stone = 5 }\nfunction pixelIds() return ids end".into()),
        )]);
        let loader = ScriptLoader::load(&cfg, &fetcher).await.unwrap();
        let value = loader.execute("pixelIds()").unwrap();
        assert_eq!(value["stone"], 5);

        let cached = std::fs::read_to_string(cache_path(&cfg)).unwrap();
        let mut lines = cached.splitn(2, '\n');
        lines.next().unwrap().trim().parse::<i64>().unwrap();
        assert!(!lines.next().unwrap().contains('\n'));
    }

    #[tokio::test]
    async fn fresh_cache_short_circuits_fetch() {
        let cfg = config("cached");
        let path = cache_path(&cfg);
        std::fs::create_dir_all(&cfg.cache_dir).unwrap();
        std::fs::write(
            &path,
            format!("{}\nids = 7", chrono::Utc::now().timestamp_millis()),
        )
        .unwrap();

        let fetcher = StubFetcher::new(vec![]);
        let loader = ScriptLoader::load(&cfg, &fetcher).await.unwrap();
        assert_eq!(loader.execute("ids").unwrap(), serde_json::json!(7));
        assert!(fetcher.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_cache_is_deleted_and_refetched() {
        let cfg = config("corrupt");
        let path = cache_path(&cfg);
        std::fs::create_dir_all(&cfg.cache_dir).unwrap();
        std::fs::write(&path, "not-a-timestamp\nids = 1").unwrap();

        let fetcher =
            StubFetcher::new(vec![(cfg.primary_url.as_str(), Ok("ids = 2".into()))]);
        let loader = ScriptLoader::load(&cfg, &fetcher).await.unwrap();
        assert_eq!(loader.execute("ids").unwrap(), serde_json::json!(2));
        // the cache was rewritten with a valid record
        let cached = std::fs::read_to_string(&path).unwrap();
        cached.lines().next().unwrap().parse::<i64>().unwrap();
    }

    #[tokio::test]
    async fn falls_back_exactly_once() {
        let cfg = config("fallback");
        let fetcher = StubFetcher::new(vec![
            (
                cfg.primary_url.as_str(),
                Err(FetchFailure::Other("down".into())),
            ),
            (
                cfg.fallback_url.as_deref().unwrap(),
                Ok("ids = 9".into()),
            ),
        ]);
        let loader = ScriptLoader::load(&cfg, &fetcher).await.unwrap();
        assert_eq!(loader.execute("ids").unwrap(), serde_json::json!(9));
        assert_eq!(fetcher.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn both_urls_exhausted_is_fetch_failed() {
        let cfg = config("exhausted");
        let fetcher = StubFetcher::new(vec![]);
        let err = ScriptLoader::load(&cfg, &fetcher).await.unwrap_err();
        assert!(matches!(err, ScriptLoaderError::FetchFailed(_)));
    }

    #[tokio::test]
    async fn tls_failure_downgrades_when_allowed() {
        let mut cfg = config("downgrade");
        cfg.allow_insecure = true;
        cfg.fallback_url = None;
        let insecure = cfg.primary_url.replace("https://", "http://");
        let fetcher = StubFetcher::new(vec![
            (
                cfg.primary_url.as_str(),
                Err(FetchFailure::Tls("bad certificate".into())),
            ),
            (insecure.as_str(), Ok("ids = 3".into())),
        ]);
        let loader = ScriptLoader::load(&cfg, &fetcher).await.unwrap();
        assert_eq!(loader.execute("ids").unwrap(), serde_json::json!(3));
        assert_eq!(
            fetcher.calls.lock().unwrap().as_slice(),
            &[cfg.primary_url.clone(), insecure]
        );
    }

    #[test]
    fn isolate_has_no_host_bindings() {
        let loader = ScriptLoader::from_source("x = 1").unwrap();
        assert_eq!(loader.execute("os == nil").unwrap(), serde_json::json!(true));
        assert_eq!(loader.execute("io == nil").unwrap(), serde_json::json!(true));
    }

    #[test]
    fn script_errors_become_text_values() {
        let loader = ScriptLoader::from_source("x = 1").unwrap();
        let value = loader.execute("error('boom')").unwrap();
        assert!(value.as_str().unwrap().contains("boom"));

        // a source that fails to load still leaves a working isolate
        let broken = ScriptLoader::from_source("this is not lua").unwrap();
        assert_eq!(broken.execute("1 + 1").unwrap(), serde_json::json!(2));
    }

    #[test]
    fn runaway_expression_hits_the_budget() {
        let loader = ScriptLoader::from_source("").unwrap();
        let value = loader
            .execute("(function() while true do end end)()")
            .unwrap();
        assert!(value.as_str().unwrap().contains("budget"));
    }
}
