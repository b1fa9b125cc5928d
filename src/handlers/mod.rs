//! Part handlers
//!
//! A part handler consumes user-data parts of the content types it claims.
//! The registry walks a processed user-data message, bracketing the walk
//! with `__begin__` / `__end__` signals so accumulating handlers can flush
//! exactly once per pass. Handler failures are logged and never abort the
//! walk.

pub mod boot_hook;
pub mod cloud_config;
pub mod external;
pub mod jinja;
pub mod shell_script;
pub mod upstart_job;

pub use boot_hook::BootHookPartHandler;
pub use cloud_config::CloudConfigPartHandler;
pub use external::ExternalPartHandler;
pub use jinja::JinjaTemplatePartHandler;
pub use shell_script::{ShellScriptByFreqPartHandler, ShellScriptPartHandler};
pub use upstart_job::UpstartJobPartHandler;

use crate::{
    CloudInitError,
    state::{CloudPaths, Frequency},
    userdata::{
        Headers, MimePart,
        types::{CONTENT_END, CONTENT_START, NOT_MULTIPART_TYPE, OCTET_TYPE, part_filename},
    },
    util,
};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Content type of parts that carry a handler
pub const PART_HANDLER_TYPE: &str = "text/part-handler";

/// One call into a handler
#[derive(Debug, Clone, Copy)]
pub struct Part<'a> {
    pub content_type: &'a str,
    pub filename: &'a str,
    pub payload: &'a [u8],
    /// Frequency of the walk; None for version 1 handlers
    pub frequency: Option<Frequency>,
    /// MIME headers of the part; version 3 handlers only
    pub headers: Option<&'a Headers>,
}

impl Part<'_> {
    /// `__begin__` or `__end__`
    pub fn is_signal(&self) -> bool {
        self.content_type == CONTENT_START || self.content_type == CONTENT_END
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(self.payload).into_owned()
    }
}

/// What a handler did with a part
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartOutcome {
    Handled,
    /// Hand a transformed payload to the handler registered for
    /// `content_type`
    Delegate {
        content_type: String,
        payload: Vec<u8>,
    },
}

/// Trait for user-data part handlers
#[async_trait]
pub trait PartHandler: Send + Sync {
    /// Name used in log lines
    fn name(&self) -> String;

    /// Content types this handler claims
    fn list_types(&self) -> Vec<String>;

    fn frequency(&self) -> Frequency {
        Frequency::PerInstance
    }

    /// Calling convention: 1 (no frequency), 2 (+frequency), 3 (+headers)
    fn handler_version(&self) -> u8 {
        1
    }

    async fn handle_part(&mut self, part: &Part<'_>) -> Result<PartOutcome, CloudInitError>;
}

/// Options for one pass over a message
#[derive(Debug, Clone)]
pub struct WalkOptions {
    pub frequency: Frequency,
    /// Content types skipped without a warning
    pub excluded: Vec<String>,
    /// Where `text/part-handler` payloads are written
    pub handler_dir: PathBuf,
}

/// Content type to handler mapping
///
/// Handlers live in an arena so one handler claiming several types is a
/// single object and receives a single `__begin__` / `__end__` pair.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Box<dyn PartHandler>>,
    types: BTreeMap<String, usize>,
    initialized: Vec<usize>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for its types; returns the types it now owns
    ///
    /// Without `overwrite` types that already have a handler are kept.
    pub fn register(&mut self, handler: Box<dyn PartHandler>, overwrite: bool) -> Vec<String> {
        let idx = self.handlers.len();
        let types = handler.list_types();
        self.handlers.push(handler);
        self.claim(idx, types, overwrite)
    }

    fn claim(&mut self, idx: usize, types: Vec<String>, overwrite: bool) -> Vec<String> {
        let mut claimed = Vec::new();
        for ctype in types {
            if !overwrite && self.types.contains_key(&ctype) {
                continue;
            }
            self.types.insert(ctype.clone(), idx);
            claimed.push(ctype);
        }
        claimed
    }

    /// Register every handler script found in `dir`, overriding built-ins
    pub async fn register_dir(&mut self, dir: &Path) -> Result<usize, CloudInitError> {
        if !dir.is_dir() {
            return Ok(0);
        }

        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            if entry.file_type().await?.is_file() {
                entries.push(entry.path());
            }
        }
        entries.sort();

        let mut count = 0;
        for path in entries {
            match ExternalPartHandler::load(&path).await {
                Ok(handler) => {
                    let claimed = self.register(Box::new(handler), true);
                    debug!("Added handler for {:?} from {}", claimed, path.display());
                    count += 1;
                }
                Err(e) => warn!("Failed at registering part handler {}: {}", path.display(), e),
            }
        }
        Ok(count)
    }

    pub fn has_handler(&self, content_type: &str) -> bool {
        self.types.contains_key(content_type)
    }

    /// Name of the handler owning `content_type`
    pub fn handler_name(&self, content_type: &str) -> Option<String> {
        self.types
            .get(content_type)
            .map(|&idx| self.handlers[idx].name())
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }

    /// Handlers that own at least one type, in registration order
    fn active_handlers(&self) -> Vec<usize> {
        let mut active: Vec<usize> = self.types.values().copied().collect();
        active.sort_unstable();
        active.dedup();
        active
    }

    /// Walk every leaf of `msg`
    ///
    /// All active handlers get `__begin__` first, parts are dispatched in
    /// message order, then every initialized handler gets `__end__`.
    pub async fn walk(&mut self, msg: &MimePart, opts: &WalkOptions) {
        self.init_handlers(opts.frequency).await;

        let mut handler_count = 0;
        for (partnum, part) in msg.leaves().into_iter().enumerate() {
            let ctype = part.content_type().unwrap_or_else(|| OCTET_TYPE.to_string());
            let filename = part.filename().unwrap_or_else(|| part_filename(partnum));
            let mut headers = part.headers.clone();
            headers.set("Content-Type", ctype.as_str());

            self.walk_part(&ctype, &filename, &part.payload, &headers, opts, &mut handler_count)
                .await;
        }

        self.finalize_handlers(opts.frequency).await;
    }

    async fn init_handlers(&mut self, frequency: Frequency) {
        for idx in self.active_handlers() {
            if self.initialized.contains(&idx) {
                continue;
            }
            self.call_signal(idx, CONTENT_START, frequency).await;
            self.initialized.push(idx);
        }
    }

    async fn finalize_handlers(&mut self, frequency: Frequency) {
        let initialized = std::mem::take(&mut self.initialized);
        for idx in initialized {
            self.call_signal(idx, CONTENT_END, frequency).await;
        }
    }

    async fn call_signal(&mut self, idx: usize, signal: &str, frequency: Frequency) {
        let mut headers = Headers::default();
        headers.set("Content-Type", signal);
        self.run_part(idx, signal, "", &[], &headers, frequency).await;
    }

    async fn walk_part(
        &mut self,
        ctype: &str,
        filename: &str,
        payload: &[u8],
        headers: &Headers,
        opts: &WalkOptions,
        handler_count: &mut usize,
    ) {
        if opts.excluded.iter().any(|e| e == ctype) {
            debug!("content_type \"{}\" is excluded", ctype);
            return;
        }

        if ctype == PART_HANDLER_TYPE {
            self.register_part_handler(payload, opts, handler_count).await;
            return;
        }

        let Some(&idx) = self.types.get(ctype) else {
            log_unhandled(ctype, payload);
            return;
        };

        let Some((sub_type, sub_payload)) = self
            .run_part(idx, ctype, filename, payload, headers, opts.frequency)
            .await
        else {
            return;
        };

        match self.types.get(&sub_type) {
            Some(&sub_idx) if sub_idx != idx => {
                let mut sub_headers = headers.clone();
                sub_headers.set("Content-Type", sub_type.as_str());
                self.run_part(sub_idx, &sub_type, filename, &sub_payload, &sub_headers, opts.frequency)
                    .await;
            }
            _ => warn!(
                "Ignoring output of {} for {}. Could not find supported sub-handler for type {}",
                self.handlers[idx].name(),
                filename,
                sub_type
            ),
        }
    }

    /// Call one handler if its frequency allows it; returns a delegation
    async fn run_part(
        &mut self,
        idx: usize,
        ctype: &str,
        filename: &str,
        payload: &[u8],
        headers: &Headers,
        frequency: Frequency,
    ) -> Option<(String, Vec<u8>)> {
        let handler = &mut self.handlers[idx];
        let handler_freq = handler.frequency();
        let allowed = handler_freq == Frequency::PerAlways
            || (frequency == Frequency::PerInstance && handler_freq == Frequency::PerInstance);
        if !allowed {
            return None;
        }

        let mut version = handler.handler_version();
        if !(1..=3).contains(&version) {
            warn!(
                "Handler {} has unknown handler version {}, calling it as version 1",
                handler.name(),
                version
            );
            version = 1;
        }
        let part = Part {
            content_type: ctype,
            filename,
            payload,
            frequency: (version >= 2).then_some(frequency),
            headers: (version == 3).then_some(headers),
        };

        debug!(
            "Calling handler {} ({}, {}, {}) with frequency {}",
            handler.name(),
            ctype,
            filename,
            version,
            frequency
        );
        match handler.handle_part(&part).await {
            Ok(PartOutcome::Handled) => None,
            Ok(PartOutcome::Delegate {
                content_type,
                payload,
            }) => Some((content_type, payload)),
            Err(e) => {
                warn!(
                    "Failed calling handler {} ({}, {}, {}) with frequency {}: {}",
                    handler.name(),
                    ctype,
                    filename,
                    version,
                    frequency,
                    e
                );
                None
            }
        }
    }

    /// Install a handler shipped inside the user-data itself
    ///
    /// It receives `__begin__` straight away and then owns its types for the
    /// rest of the walk, ahead of any built-in handler.
    async fn register_part_handler(
        &mut self,
        payload: &[u8],
        opts: &WalkOptions,
        handler_count: &mut usize,
    ) {
        let path = opts
            .handler_dir
            .join(format!("part-handler-{:03}", *handler_count));

        let loaded = async {
            util::write_file(&path, payload, 0o600).await?;
            ExternalPartHandler::load(&path).await
        }
        .await;

        match loaded {
            Ok(handler) => {
                let idx = self.handlers.len();
                let types = handler.list_types();
                self.handlers.push(Box::new(handler));
                self.call_signal(idx, CONTENT_START, opts.frequency).await;
                let claimed = self.claim(idx, types, true);
                self.initialized.push(idx);
                info!("Registered part handler {} for {:?}", path.display(), claimed);
                *handler_count += 1;
            }
            Err(e) => warn!(
                "Failed at registering part handler file: {} (part handler {}): {}",
                path.display(),
                handler_count,
                e
            ),
        }
    }
}

fn log_unhandled(ctype: &str, payload: &[u8]) {
    if payload.is_empty() {
        debug!("Empty payload of type {}", ctype);
        return;
    }

    let head = &payload[..payload.len().min(4 * 24)];
    let text = String::from_utf8_lossy(head);
    let first: String = text.split('\n').next().unwrap_or("").chars().take(24).collect();
    let details = format!("'{}...'", first.escape_default());

    if ctype == NOT_MULTIPART_TYPE {
        warn!("Unhandled non-multipart ({}) userdata: {}", ctype, details);
    } else {
        warn!("Unhandled unknown content-type ({}) userdata: {}", ctype, details);
    }
}

/// Make a part filename safe to use as a file name
pub fn clean_filename(filename: &str) -> String {
    filename
        .replace('/', "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || "_-.()".contains(*c))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Normalize CRLF line endings in text payloads
pub fn dos2unix(payload: &[u8]) -> Vec<u8> {
    match std::str::from_utf8(payload) {
        Ok(text) if text.contains("\r\n") => text.replace("\r\n", "\n").into_bytes(),
        _ => payload.to_vec(),
    }
}

/// Built-in handlers for user-data, or for vendor-data when `vendor` is set
///
/// Vendor handlers write `vendor-cloud-config.txt` and `vendor_scripts/`
/// instead of the user locations.
pub fn default_handlers(
    paths: &CloudPaths,
    instance_id: &str,
    vendor: bool,
) -> Vec<Box<dyn PartHandler>> {
    vec![
        Box::new(CloudConfigPartHandler::new(paths, instance_id, vendor)),
        Box::new(ShellScriptPartHandler::new(paths, instance_id, vendor)),
        Box::new(ShellScriptByFreqPartHandler::new(paths, Frequency::PerAlways)),
        Box::new(ShellScriptByFreqPartHandler::new(paths, Frequency::PerInstance)),
        Box::new(ShellScriptByFreqPartHandler::new(paths, Frequency::PerOnce)),
        Box::new(BootHookPartHandler::new(paths, instance_id)),
        Box::new(UpstartJobPartHandler::new(paths)),
        Box::new(JinjaTemplatePartHandler::new(paths)),
    ]
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::userdata::create_multipart;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    /// Records every call it receives
    pub(crate) struct RecordingHandler {
        pub name: &'static str,
        pub types: Vec<&'static str>,
        pub frequency: Frequency,
        pub version: u8,
        pub fail_on: Option<&'static str>,
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingHandler {
        pub fn new(name: &'static str, types: Vec<&'static str>, calls: Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                types,
                frequency: Frequency::PerAlways,
                version: 2,
                fail_on: None,
                calls,
            }
        }
    }

    #[async_trait]
    impl PartHandler for RecordingHandler {
        fn name(&self) -> String {
            self.name.to_string()
        }

        fn list_types(&self) -> Vec<String> {
            self.types.iter().map(|t| t.to_string()).collect()
        }

        fn frequency(&self) -> Frequency {
            self.frequency
        }

        fn handler_version(&self) -> u8 {
            self.version
        }

        async fn handle_part(&mut self, part: &Part<'_>) -> Result<PartOutcome, CloudInitError> {
            self.calls.lock().unwrap().push(format!(
                "{}:{}:{}:{}",
                self.name,
                part.content_type,
                part.filename,
                part.frequency.map(|f| f.as_str()).unwrap_or("-")
            ));
            if self.fail_on == Some(part.filename) {
                return Err(CloudInitError::handler(self.name, "boom"));
            }
            Ok(PartOutcome::Handled)
        }
    }

    fn opts(temp: &TempDir, frequency: Frequency) -> WalkOptions {
        WalkOptions {
            frequency,
            excluded: Vec::new(),
            handler_dir: temp.path().join("handlers"),
        }
    }

    fn message(parts: &[(&str, &str, &str)]) -> MimePart {
        create_multipart(
            parts
                .iter()
                .map(|(ctype, filename, payload)| {
                    let mut part = MimePart::new(ctype, payload.as_bytes());
                    part.set_filename(filename);
                    part
                })
                .collect(),
        )
    }

    fn calls() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_begin_end_bracketing_survives_failures() {
        let temp = TempDir::new().unwrap();
        let log = calls();
        let mut handler = RecordingHandler::new("cc", vec!["text/cloud-config"], log.clone());
        handler.fail_on = Some("one");
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(handler), true);

        let msg = message(&[
            ("text/cloud-config", "one", "a: 1"),
            ("text/cloud-config", "two", "b: 2"),
        ]);
        registry.walk(&msg, &opts(&temp, Frequency::PerInstance)).await;

        let log = log.lock().unwrap();
        assert_eq!(
            *log,
            vec![
                "cc:__begin__::once-per-instance",
                "cc:text/cloud-config:one:once-per-instance",
                "cc:text/cloud-config:two:once-per-instance",
                "cc:__end__::once-per-instance",
            ]
        );
    }

    #[tokio::test]
    async fn test_frequency_gating() {
        let temp = TempDir::new().unwrap();
        let log = calls();
        let mut per_instance = RecordingHandler::new("inst", vec!["text/a"], log.clone());
        per_instance.frequency = Frequency::PerInstance;
        let always = RecordingHandler::new("always", vec!["text/b"], log.clone());

        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(per_instance), true);
        registry.register(Box::new(always), true);

        let msg = message(&[("text/a", "a", "x"), ("text/b", "b", "y")]);
        registry.walk(&msg, &opts(&temp, Frequency::PerAlways)).await;

        let log = log.lock().unwrap();
        assert!(log.iter().all(|c| c.starts_with("always:")));
        assert_eq!(log.len(), 3);
    }

    #[tokio::test]
    async fn test_version_one_gets_no_frequency() {
        let temp = TempDir::new().unwrap();
        let log = calls();
        let mut handler = RecordingHandler::new("v1", vec!["text/a"], log.clone());
        handler.version = 1;
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(handler), true);

        registry
            .walk(&message(&[("text/a", "f", "x")]), &opts(&temp, Frequency::PerInstance))
            .await;
        assert_eq!(log.lock().unwrap()[1], "v1:text/a:f:-");
    }

    #[tokio::test]
    async fn test_unknown_version_is_called_as_version_one() {
        let temp = TempDir::new().unwrap();
        let log = calls();
        let mut handler = RecordingHandler::new("v7", vec!["text/a"], log.clone());
        handler.version = 7;
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(handler), true);

        registry
            .walk(&message(&[("text/a", "f", "x")]), &opts(&temp, Frequency::PerInstance))
            .await;
        assert_eq!(log.lock().unwrap()[1], "v7:text/a:f:-");
    }

    #[tokio::test]
    async fn test_register_without_overwrite_keeps_existing() {
        let log = calls();
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(RecordingHandler::new("first", vec!["text/a"], log.clone())), false);
        let claimed = registry.register(
            Box::new(RecordingHandler::new("second", vec!["text/a", "text/b"], log.clone())),
            false,
        );
        assert_eq!(claimed, vec!["text/b"]);
        assert_eq!(registry.handler_name("text/a").as_deref(), Some("first"));
        assert_eq!(registry.handler_name("text/b").as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_excluded_and_unhandled_parts_are_skipped() {
        let temp = TempDir::new().unwrap();
        let log = calls();
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(RecordingHandler::new("a", vec!["text/a"], log.clone())), true);

        let mut walk_opts = opts(&temp, Frequency::PerInstance);
        walk_opts.excluded = vec!["text/a".to_string()];
        let msg = message(&[("text/a", "f", "x"), ("text/unknown", "g", "y")]);
        registry.walk(&msg, &walk_opts).await;

        let log = log.lock().unwrap();
        assert_eq!(*log, vec!["a:__begin__::once-per-instance", "a:__end__::once-per-instance"]);
    }

    #[tokio::test]
    async fn test_default_filename_is_zero_based() {
        let temp = TempDir::new().unwrap();
        let log = calls();
        let mut registry = HandlerRegistry::new();
        registry.register(Box::new(RecordingHandler::new("a", vec!["text/a"], log.clone())), true);

        let msg = create_multipart(vec![MimePart::new("text/a", "x"), MimePart::new("text/a", "y")]);
        registry.walk(&msg, &opts(&temp, Frequency::PerInstance)).await;
        let log = log.lock().unwrap();
        assert_eq!(log[1], "a:text/a:part-000:once-per-instance");
        assert_eq!(log[2], "a:text/a:part-001:once-per-instance");
    }

    #[tokio::test]
    async fn test_user_part_handler_overrides_builtin() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_root(temp.path());
        let out = temp.path().join("custom.out");

        let mut registry = HandlerRegistry::new();
        for handler in default_handlers(&paths, "i-1", false) {
            registry.register(handler, false);
        }

        let script = format!(
            "#!/bin/sh\n# list-types: text/cloud-config\n# handler-version: 2\n# frequency: always\n\
             [ \"$1\" = text/cloud-config ] && cat >> {}\nexit 0\n",
            out.display()
        );
        let msg = create_multipart(vec![
            MimePart::new(PART_HANDLER_TYPE, script),
            MimePart::new("text/cloud-config", "#cloud-config\nkey: value\n"),
        ]);
        let walk_opts = WalkOptions {
            frequency: Frequency::PerInstance,
            excluded: Vec::new(),
            handler_dir: paths.instance_handlers_dir("i-1"),
        };
        registry.walk(&msg, &walk_opts).await;

        assert_eq!(
            registry.handler_name("text/cloud-config").as_deref(),
            Some("part-handler-000")
        );
        assert!(paths.instance_handlers_dir("i-1").join("part-handler-000").exists());
        assert_eq!(
            std::fs::read_to_string(&out).unwrap(),
            "#cloud-config\nkey: value\n"
        );
        // The built-in flushed an empty buffer
        assert_eq!(std::fs::read_to_string(paths.cloud_config("i-1")).unwrap(), "");
    }

    #[tokio::test]
    async fn test_register_dir_loads_scripts() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("handlers");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("good"), "#!/bin/sh\n# list-types: text/x-good\n").unwrap();
        std::fs::write(dir.join("bad"), "#!/bin/sh\necho\n").unwrap();

        let mut registry = HandlerRegistry::new();
        assert_eq!(registry.register_dir(&dir).await.unwrap(), 1);
        assert!(registry.has_handler("text/x-good"));
        assert_eq!(registry.register_dir(&temp.path().join("missing")).await.unwrap(), 0);
    }

    #[test]
    fn test_clean_filename() {
        assert_eq!(clean_filename("a/b c$.sh"), "a_bc.sh");
        assert_eq!(clean_filename("part-001"), "part-001");
    }

    #[test]
    fn test_dos2unix() {
        assert_eq!(dos2unix(b"a\r\nb\r\n"), b"a\nb\n");
        assert_eq!(dos2unix(&[0xff, b'\r', b'\n']), vec![0xff, b'\r', b'\n']);
    }
}
