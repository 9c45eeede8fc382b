use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabError {
    #[error("Configuration Error: {0}")]
    SettingsError(#[from] SettingsError),

    #[error("Readiness Error: {0}")]
    ReadinessError(#[from] ReadinessError),

    #[error("Provider Error: {0}")]
    ProviderError(#[from] ProviderError),

    #[error("Graph Error: {0}")]
    GraphError(#[from] GraphError),

    #[error("Credential Error: {0}")]
    CredentialError(#[from] CredentialError),

    #[error("State Error: {0}")]
    StateError(#[from] crate::monitoring::TransitionError),

    #[error("Template Error: {0}")]
    TemplateError(#[from] minijinja::Error),

    #[error("System Error: {0}")]
    SystemError(#[from] std::io::Error),

    #[error("Deployment cancelled")]
    Cancelled,
}

/// Terminal failures of a guest-readiness condition.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadinessError {
    #[error("{condition}: {query_path} == {value} for instance {instance}")]
    GuestReportedFailure {
        condition: String,
        instance: String,
        query_path: String,
        value: String,
    },

    #[error("{condition}: guest attribute query {query_path} on {instance} failed with status {status}: {message}")]
    Api {
        condition: String,
        instance: String,
        query_path: String,
        status: u16,
        message: String,
    },

    #[error("{condition}: polling cancelled")]
    Cancelled { condition: String },

    #[error("{condition}: {query_path} not ready after {after:?}")]
    TimedOut {
        condition: String,
        query_path: String,
        after: Duration,
    },
}

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{resource}: request failed with status {status}: {message}")]
    Api {
        resource: String,
        status: u16,
        message: String,
    },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("authentication failed: {0}")]
    Auth(#[from] CredentialError),

    #[error("{resource}: operation failed: {message}")]
    Operation { resource: String, message: String },

    #[error("{resource}: dependency output missing")]
    MissingOutput { resource: String },

    #[error("instance group {group} requires at least one subnet")]
    EmptySubnetPool { group: String },
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum GraphError {
    #[error("resource {0} declared twice")]
    DuplicateResource(String),

    #[error("resource {resource} depends on undeclared resource {dependency}")]
    UnknownDependency { resource: String, dependency: String },

    #[error("unknown resource {0}")]
    UnknownResource(String),
}

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to load settings: {0}")]
    Load(#[from] config::ConfigError),

    #[error("missing required setting `{key}`")]
    Missing { key: &'static str },

    #[error("unknown lab type `{0}` (expected VM, K8S or BIGDATA)")]
    UnknownLabType(String),

    #[error("lab type {0} is not implemented")]
    Unimplemented(String),

    #[error("invalid setting `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum CredentialError {
    #[error("cannot read credentials file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed credentials: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("cannot sign token request: {0}")]
    Sign(#[from] jsonwebtoken::errors::Error),

    #[error("token endpoint returned {status}: {message}")]
    Token { status: u16, message: String },

    #[error("token request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type LabResult<T> = Result<T, LabError>;
