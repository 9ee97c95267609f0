//! Engine context owned by the process entry point
//!
//! [`InputContext`] ties the configuration to a running engine: it creates
//! and opens the backend, builds the router and loads every configured table
//! and post-lookup document. Nothing here is global; the daemon creates one
//! context and passes the router to whatever needs it.

use std::sync::Arc;

use tokio::runtime::Handle;
use virtual_input_config::Config;

use crate::backend::{self, KeySink};
use crate::error::InputError;
use crate::post_lookup::PostLookupStore;
use crate::router::EventRouter;

pub struct InputContext {
    config: Config,
    post_lookups: Arc<PostLookupStore>,
    backend: Option<Arc<dyn KeySink>>,
    router: Option<EventRouter>,
}

impl InputContext {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            post_lookups: Arc::new(PostLookupStore::new()),
            backend: None,
            router: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Router of an initialized context
    pub fn router(&self) -> Option<&EventRouter> {
        self.router.as_ref()
    }

    /// Create the backend and the router and load the configured documents.
    ///
    /// A backend that cannot be created is logged and leaves the context
    /// without a router; one that fails to open is logged and kept. Tables
    /// that fail to load are created empty so the default designation stays
    /// resolvable. Fails only if the default table cannot be set.
    pub fn initialize(&mut self, runtime: Handle) -> Result<(), InputError> {
        if self.router.is_some() {
            return Ok(());
        }

        let global = &self.config.global;

        let backend = match backend::create(
            global.backend,
            &global.locator,
            runtime.clone(),
            Arc::clone(&self.post_lookups),
        ) {
            Ok(backend) => backend,
            Err(e) => {
                tracing::error!("No {:?} backend available: {}", global.backend, e);
                return Ok(());
            }
        };

        if let Err(e) = backend.open() {
            tracing::error!("Failed to open {:?} backend: {}", global.backend, e);
        }

        let router = EventRouter::new(runtime, Arc::clone(&backend), Arc::clone(&self.post_lookups));
        router.set_repeat(
            global.repeat.start_ms,
            global.repeat.interval_ms,
            global.repeat.limit,
        );

        for table in &self.config.tables {
            match router.load_table(&table.name, &table.path, table.pass_through) {
                Ok(0) => {}
                Ok(malformed) => tracing::warn!(
                    "Table '{}': {} malformed row(s) skipped",
                    table.name,
                    malformed
                ),
                Err(e) => {
                    tracing::warn!("Failed to load table '{}': {}", table.name, e);
                    router.update_table(&table.name, |t| t.set_pass_through(table.pass_through));
                }
            }
        }

        self.backend = Some(backend);
        self.router = Some(router);

        self.reload_post_lookups();

        if let (Some(name), Some(router)) = (&self.config.global.default_table, &self.router) {
            router.set_default(name)?;
        }

        tracing::info!(
            "Input context initialized ({} table(s), {} post-lookup document(s))",
            self.config.tables.len(),
            self.config.post_lookups.len()
        );
        Ok(())
    }

    /// Reload every configured post-lookup document. Returns how many loaded.
    pub fn reload_post_lookups(&self) -> usize {
        let Some(router) = &self.router else {
            return 0;
        };

        let mut loaded = 0;
        for post_lookup in &self.config.post_lookups {
            match router.post_lookup(&post_lookup.session, &post_lookup.path) {
                Ok(_) => loaded += 1,
                Err(e) => tracing::warn!(
                    "Failed to load post-lookup for session '{}': {}",
                    post_lookup.session,
                    e
                ),
            }
        }
        loaded
    }

    /// Stop repeat, close the backend and drop the engine
    pub fn deinitialize(&mut self) {
        if let Some(router) = self.router.take() {
            router.shutdown();
        }

        if let Some(backend) = self.backend.take() {
            if let Err(e) = backend.close() {
                tracing::warn!("Failed to close backend: {}", e);
            }
        }
    }
}

impl Drop for InputContext {
    fn drop(&mut self) {
        self.deinitialize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtual_input_config::{BackendKind, PostLookupConfig, TableConfig};

    fn config(dir: &tempfile::TempDir) -> Config {
        let table = dir.path().join("remote.kdl");
        std::fs::write(&table, "key code=0xe002 key=2 \"LEFTSHIFT\"\n").unwrap();
        let netflix = dir.path().join("netflix.kdl");
        std::fs::write(&netflix, "conversion {\n    in code=10\n    out code=99\n}\n").unwrap();

        let mut config = Config::default();
        config.global.locator = dir.path().join("keyhandler");
        config.global.default_table = Some("remote".to_string());
        config.tables = vec![
            TableConfig {
                name: "remote".to_string(),
                path: table,
                pass_through: false,
            },
            TableConfig {
                name: "missing".to_string(),
                path: dir.path().join("missing.kdl"),
                pass_through: true,
            },
        ];
        config.post_lookups = vec![PostLookupConfig {
            session: "netflix".to_string(),
            path: netflix,
        }];
        config
    }

    #[tokio::test]
    async fn test_initialize_and_deinitialize() {
        let dir = tempfile::tempdir().unwrap();
        let mut context = InputContext::new(config(&dir));
        context.initialize(Handle::current()).unwrap();

        let router = context.router().unwrap();
        assert_eq!(router.table_names(), vec!["missing".to_string(), "remote".to_string()]);
        assert_eq!(router.default_table(), Some("remote".to_string()));
        assert!(router.post_lookups().find("netflix").is_some());
        assert!(context.config().global.locator.exists());

        context.deinitialize();
        assert!(context.router().is_none());
        assert!(!dir.path().join("keyhandler").exists());
    }

    #[tokio::test]
    async fn test_missing_device_node_leaves_no_router() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.global.backend = BackendKind::Device;
        config.global.locator = dir.path().join("uinput");

        let mut context = InputContext::new(config);
        context.initialize(Handle::current()).unwrap();
        assert!(context.router().is_none());
        assert_eq!(context.reload_post_lookups(), 0);
    }

    #[tokio::test]
    async fn test_unknown_default_table_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.global.default_table = Some("nope".to_string());

        let mut context = InputContext::new(config);
        assert!(matches!(
            context.initialize(Handle::current()),
            Err(InputError::UnknownTable { .. })
        ));
    }
}
