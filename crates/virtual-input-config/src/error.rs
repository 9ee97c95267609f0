use miette::Diagnostic;
use thiserror::Error;

#[derive(Error, Diagnostic, Debug)]
pub enum ConfigError {
    #[error("Failed to parse KDL")]
    #[diagnostic(code(virtual_input::config::parse_error))]
    ParseError {
        #[source_code]
        src: String,
        #[label("here")]
        span: miette::SourceSpan,
        #[source]
        source: kdl::KdlError,
    },

    #[error("Invalid configuration: {message}")]
    #[diagnostic(code(virtual_input::config::invalid))]
    Invalid { message: String },

    #[error("Missing required field: {field}")]
    #[diagnostic(code(virtual_input::config::missing_field))]
    MissingField { field: String },

    #[error("Unknown modifier: {name}")]
    #[diagnostic(
        code(virtual_input::config::unknown_modifier),
        help("valid modifiers are LEFTSHIFT, RIGHTSHIFT, LEFTALT, RIGHTALT, LEFTCTRL, RIGHTCTRL")
    )]
    UnknownModifier { name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
