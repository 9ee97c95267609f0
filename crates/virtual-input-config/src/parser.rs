//! KDL document parsers

use std::path::{Path, PathBuf};

use crate::error::ConfigError;
use crate::model::*;

/// Parse a KDL document, attaching the source for diagnostics on failure
fn parse_document(content: &str) -> Result<kdl::KdlDocument, ConfigError> {
    content.parse().map_err(|e: kdl::KdlError| {
        // kdl depends on an older miette, so the span is rebuilt by hand
        let offset = e.span.offset();
        let len = e.span.len();
        let span = miette::SourceSpan::from((offset, len));
        ConfigError::ParseError {
            src: content.to_string(),
            span,
            source: e,
        }
    })
}

/// First positional argument of a node as a string
fn first_string_arg(node: &kdl::KdlNode) -> Option<&str> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
}

/// Named property as a string
fn string_prop<'a>(node: &'a kdl::KdlNode, key: &str) -> Option<&'a str> {
    node.get(key).and_then(|e| e.value().as_string())
}

/// Named property as an integer
fn int_prop(node: &kdl::KdlNode, key: &str) -> Option<i64> {
    node.get(key).and_then(|e| e.value().as_i64())
}

fn u16_prop(node: &kdl::KdlNode, key: &str) -> Result<Option<u16>, ConfigError> {
    match int_prop(node, key) {
        None => Ok(None),
        Some(v) => u16::try_from(v).map(Some).map_err(|_| ConfigError::Invalid {
            message: format!("{}={} is out of range for a 16-bit value", key, v),
        }),
    }
}

fn expand_path(raw: &str) -> PathBuf {
    shellexpand::tilde(raw).into_owned().into()
}

/// Collect the positional string arguments of a node as a modifier mask
fn parse_modifiers(node: &kdl::KdlNode) -> Result<ModifierMask, ConfigError> {
    let mut mask = ModifierMask::NONE;

    for entry in node.entries().iter().filter(|e| e.name().is_none()) {
        let name = entry.value().as_string().ok_or_else(|| ConfigError::Invalid {
            message: format!("modifier names must be strings, got {}", entry.value()),
        })?;
        let modifier = Modifier::from_name(name).ok_or_else(|| ConfigError::UnknownModifier {
            name: name.to_string(),
        })?;
        mask.insert(modifier);
    }

    Ok(mask)
}

// ============================================================================
// Daemon configuration
// ============================================================================

/// Parse a configuration file from the given path
pub fn parse_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_config_str(&content)
}

/// Parse configuration from a string
pub fn parse_config_str(content: &str) -> Result<Config, ConfigError> {
    let doc = parse_document(content)?;

    let mut config = Config::default();

    for node in doc.nodes() {
        match node.name().value() {
            "global" => {
                config.global = parse_global(node)?;
            }
            "table" => {
                config.tables.push(parse_table(node)?);
            }
            "source" => {
                config.sources.push(parse_source(node)?);
            }
            "post-lookup" => {
                config.post_lookups.push(parse_post_lookup_entry(node)?);
            }
            name => {
                tracing::warn!("Unknown top-level node: {}", name);
            }
        }
    }

    if let Some(default) = &config.global.default_table {
        if !config.tables.iter().any(|t| &t.name == default) {
            return Err(ConfigError::Invalid {
                message: format!(
                    "default-table '{}' does not name a configured table",
                    default
                ),
            });
        }
    }

    Ok(config)
}

fn parse_global(node: &kdl::KdlNode) -> Result<GlobalConfig, ConfigError> {
    let mut global = GlobalConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "log-level" => {
                    if let Some(val) = first_string_arg(child) {
                        global.log_level = val
                            .parse()
                            .map_err(|e| ConfigError::Invalid { message: e })?;
                    }
                }
                "backend" => {
                    if let Some(val) = first_string_arg(child) {
                        global.backend = val
                            .parse()
                            .map_err(|e| ConfigError::Invalid { message: e })?;
                    }
                }
                "locator" => {
                    if let Some(val) = first_string_arg(child) {
                        global.locator = expand_path(val);
                    }
                }
                "repeat" => {
                    if let Some(start) = u16_prop(child, "start")? {
                        global.repeat.start_ms = start;
                    }
                    if let Some(interval) = u16_prop(child, "interval")? {
                        global.repeat.interval_ms = interval;
                    }
                    if let Some(limit) = u16_prop(child, "limit")? {
                        global.repeat.limit = limit;
                    }
                    if global.repeat.start_ms > 0 && global.repeat.interval_ms == 0 {
                        return Err(ConfigError::Invalid {
                            message: "repeat interval must be at least 1ms when start is set"
                                .to_string(),
                        });
                    }
                }
                "default-table" => {
                    global.default_table = first_string_arg(child)
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string());
                }
                name => {
                    tracing::warn!("Unknown global config option: {}", name);
                }
            }
        }
    }

    Ok(global)
}

fn parse_table(node: &kdl::KdlNode) -> Result<TableConfig, ConfigError> {
    let name = first_string_arg(node).ok_or_else(|| ConfigError::MissingField {
        field: "table name (e.g., `table \"remote\" path=\"...\"`)".to_string(),
    })?;
    let path = string_prop(node, "path").ok_or_else(|| ConfigError::MissingField {
        field: format!("path for table '{}'", name),
    })?;
    let pass_through = node
        .get("pass-through")
        .and_then(|e| e.value().as_bool())
        .unwrap_or(false);

    Ok(TableConfig {
        name: name.to_string(),
        path: expand_path(path),
        pass_through,
    })
}

fn parse_source(node: &kdl::KdlNode) -> Result<SourceConfig, ConfigError> {
    let path = first_string_arg(node).ok_or_else(|| ConfigError::MissingField {
        field: "source device path (e.g., `source \"/dev/input/event3\"`)".to_string(),
    })?;

    Ok(SourceConfig {
        path: expand_path(path),
        table: string_prop(node, "table").map(|s| s.to_string()),
        grab: node
            .get("grab")
            .and_then(|e| e.value().as_bool())
            .unwrap_or(true),
    })
}

fn parse_post_lookup_entry(node: &kdl::KdlNode) -> Result<PostLookupConfig, ConfigError> {
    let session = first_string_arg(node).ok_or_else(|| ConfigError::MissingField {
        field: "session name (e.g., `post-lookup \"netflix\" path=\"...\"`)".to_string(),
    })?;
    let path = string_prop(node, "path").ok_or_else(|| ConfigError::MissingField {
        field: format!("path for post-lookup '{}'", session),
    })?;

    Ok(PostLookupConfig {
        session: session.to_string(),
        path: expand_path(path),
    })
}

// ============================================================================
// Key-table documents
// ============================================================================

/// Parse a key-table document from the given path
pub fn parse_key_table(path: &Path) -> Result<KeyTableDocument, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_key_table_str(&content)
}

/// Parse a key-table document from a string.
///
/// Only a KDL syntax error fails the whole document. Rows that cannot be
/// interpreted are counted in [`KeyTableDocument::malformed`].
pub fn parse_key_table_str(content: &str) -> Result<KeyTableDocument, ConfigError> {
    let doc = parse_document(content)?;
    let mut table = KeyTableDocument::default();

    for node in doc.nodes() {
        match parse_key_row(node) {
            Ok(row) => table.rows.push(row),
            Err(e) => {
                tracing::warn!("Skipping malformed key row `{}`: {}", node.name().value(), e);
                table.malformed += 1;
            }
        }
    }

    Ok(table)
}

fn parse_key_row(node: &kdl::KdlNode) -> Result<KeyRow, ConfigError> {
    if node.name().value() != "key" {
        return Err(ConfigError::Invalid {
            message: format!("expected a `key` row, found `{}`", node.name().value()),
        });
    }

    let code = int_prop(node, "code").ok_or_else(|| ConfigError::MissingField {
        field: "code".to_string(),
    })?;
    let code = u32::try_from(code).map_err(|_| ConfigError::Invalid {
        message: format!("code={:#x} is out of range for a 32-bit scan code", code),
    })?;
    let key = u16_prop(node, "key")?.ok_or_else(|| ConfigError::MissingField {
        field: "key".to_string(),
    })?;
    let modifiers = parse_modifiers(node)?;

    Ok(KeyRow {
        code,
        key,
        modifiers,
    })
}

// ============================================================================
// Post-lookup documents
// ============================================================================

/// Parse a post-lookup document from the given path
pub fn parse_post_lookup(path: &Path) -> Result<PostLookupDocument, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    parse_post_lookup_str(&content)
}

/// Parse a post-lookup document from a string.
///
/// A conversion needs both an `in` and an `out` side; incomplete or
/// malformed conversions are skipped and counted.
pub fn parse_post_lookup_str(content: &str) -> Result<PostLookupDocument, ConfigError> {
    let doc = parse_document(content)?;
    let mut table = PostLookupDocument::default();

    for node in doc.nodes() {
        if node.name().value() != "conversion" {
            tracing::warn!("Unknown post-lookup node: {}", node.name().value());
            table.skipped += 1;
            continue;
        }

        match parse_conversion(node) {
            Ok(conversion) => table.conversions.push(conversion),
            Err(e) => {
                tracing::warn!("Skipping conversion: {}", e);
                table.skipped += 1;
            }
        }
    }

    Ok(table)
}

fn parse_conversion(node: &kdl::KdlNode) -> Result<Conversion, ConfigError> {
    let mut input = None;
    let mut output = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "in" => input = Some(parse_key_spec(child)?),
                "out" => output = Some(parse_key_spec(child)?),
                name => {
                    tracing::warn!("Unknown conversion option: {}", name);
                }
            }
        }
    }

    match (input, output) {
        (Some(input), Some(output)) => Ok(Conversion { input, output }),
        (None, _) => Err(ConfigError::MissingField {
            field: "conversion `in`".to_string(),
        }),
        (_, None) => Err(ConfigError::MissingField {
            field: "conversion `out`".to_string(),
        }),
    }
}

fn parse_key_spec(node: &kdl::KdlNode) -> Result<KeySpec, ConfigError> {
    let code = u16_prop(node, "code")?.ok_or_else(|| ConfigError::MissingField {
        field: format!("{} code", node.name().value()),
    })?;
    let mods = parse_modifiers(node)?;

    Ok(KeySpec { code, mods })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_config() {
        let config = r#"
            global {
                log-level "debug"
                backend "device"
                locator "/dev/uinput"
                repeat start=250 interval=40 limit=10
                default-table "remote"
            }

            table "remote" path="/etc/virtual-input/remote.kdl"
            table "web" path="/etc/virtual-input/web.kdl" pass-through=true
            source "/dev/input/event3" table="remote" grab=false
            post-lookup "netflix" path="/etc/virtual-input/netflix.kdl"
        "#;

        let config = parse_config_str(config).unwrap();
        assert_eq!(config.global.log_level, LogLevel::Debug);
        assert_eq!(config.global.backend, BackendKind::Device);
        assert_eq!(config.global.locator, PathBuf::from("/dev/uinput"));
        assert_eq!(
            config.global.repeat,
            RepeatConfig {
                start_ms: 250,
                interval_ms: 40,
                limit: 10
            }
        );
        assert_eq!(config.global.default_table.as_deref(), Some("remote"));

        assert_eq!(config.tables.len(), 2);
        assert!(!config.tables[0].pass_through);
        assert!(config.tables[1].pass_through);

        assert_eq!(config.sources.len(), 1);
        assert_eq!(config.sources[0].table.as_deref(), Some("remote"));
        assert!(!config.sources[0].grab);

        assert_eq!(config.post_lookups.len(), 1);
        assert_eq!(config.post_lookups[0].session, "netflix");
    }

    #[test]
    fn test_defaults_when_global_missing() {
        let config = parse_config_str(r#"table "remote" path="remote.kdl""#).unwrap();
        assert_eq!(config.global.backend, BackendKind::Virtual);
        assert_eq!(config.global.repeat, RepeatConfig::default());
        assert!(config.global.default_table.is_none());
    }

    #[test]
    fn test_default_table_must_exist() {
        let config = r#"
            global {
                default-table "missing"
            }
            table "remote" path="remote.kdl"
        "#;

        let result = parse_config_str(config);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_table_missing_path_error() {
        let result = parse_config_str(r#"table "remote""#);
        assert!(matches!(result, Err(ConfigError::MissingField { .. })));
    }

    #[test]
    fn test_repeat_out_of_range() {
        let config = r#"
            global {
                repeat start=70000
            }
        "#;
        assert!(matches!(
            parse_config_str(config),
            Err(ConfigError::Invalid { .. })
        ));
    }

    #[test]
    fn test_repeat_zero_interval_rejected() {
        let config = r#"
            global {
                repeat start=500 interval=0
            }
        "#;
        assert!(matches!(
            parse_config_str(config),
            Err(ConfigError::Invalid { .. })
        ));

        // Repeat disabled: the interval is irrelevant
        let config = parse_config_str("global {\n    repeat start=0 interval=0\n}\n").unwrap();
        assert_eq!(config.global.repeat.start_ms, 0);
    }

    #[test]
    fn test_syntax_error_reports_span() {
        let result = parse_config_str("global {");
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_parse_key_table_rows() {
        let doc = r#"
            key code=0x0000e001 key=30
            key code=0x0000e002 key=2 "LEFTSHIFT"
            key code=0x0000e003 key=16 "leftctrl" "RIGHTALT"
        "#;

        let table = parse_key_table_str(doc).unwrap();
        assert_eq!(table.malformed, 0);
        assert_eq!(
            table.rows,
            vec![
                KeyRow {
                    code: 0xe001,
                    key: 30,
                    modifiers: ModifierMask::NONE
                },
                KeyRow {
                    code: 0xe002,
                    key: 2,
                    modifiers: Modifier::LeftShift.into()
                },
                KeyRow {
                    code: 0xe003,
                    key: 16,
                    modifiers: [Modifier::LeftCtrl, Modifier::RightAlt]
                        .into_iter()
                        .collect()
                },
            ]
        );
    }

    #[test]
    fn test_malformed_rows_are_counted_not_fatal() {
        let doc = r#"
            key code=0x10 key=1
            key key=2
            key code=0x11
            key code=0x12 key=70000
            key code=0x13 key=3 "HYPER"
            entry code=0x14 key=4
            key code=0x15 key=5
        "#;

        let table = parse_key_table_str(doc).unwrap();
        assert_eq!(table.malformed, 5);
        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[1].code, 0x15);
    }

    #[test]
    fn test_key_table_syntax_error_is_fatal() {
        assert!(parse_key_table_str("key code=").is_err());
    }

    #[test]
    fn test_parse_post_lookup() {
        let doc = r#"
            conversion {
                in code=10 "LEFTSHIFT"
                out code=99
            }
            conversion {
                in code=11
                out code=12 "RIGHTCTRL"
            }
        "#;

        let table = parse_post_lookup_str(doc).unwrap();
        assert_eq!(table.skipped, 0);
        assert_eq!(table.conversions.len(), 2);
        assert_eq!(
            table.conversions[0],
            Conversion {
                input: KeySpec {
                    code: 10,
                    mods: Modifier::LeftShift.into()
                },
                output: KeySpec {
                    code: 99,
                    mods: ModifierMask::NONE
                },
            }
        );
        assert_eq!(table.conversions[1].output.mods, Modifier::RightCtrl.into());
    }

    #[test]
    fn test_post_lookup_incomplete_conversion_skipped() {
        let doc = r#"
            conversion {
                in code=10
            }
            conversion {
                out code=10
            }
            conversion {
                in code=1
                out code=2
            }
        "#;

        let table = parse_post_lookup_str(doc).unwrap();
        assert_eq!(table.skipped, 2);
        assert_eq!(table.conversions.len(), 1);
    }

    #[test]
    fn test_parse_key_table_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote.kdl");
        std::fs::write(&path, "key code=0x1 key=2\n").unwrap();

        let table = parse_key_table(&path).unwrap();
        assert_eq!(table.rows.len(), 1);
        assert!(matches!(
            parse_key_table(&dir.path().join("missing.kdl")),
            Err(ConfigError::Io(_))
        ));
    }
}
