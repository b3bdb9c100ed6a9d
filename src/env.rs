//! Environment variable validation and configuration module for Floodgate
//!
//! This module provides centralized validation and configuration management
//! for all environment variables used by the gateway.
//!
//! # Supported Environment Variables
//!
//! ## Server Configuration
//! - `FLOODGATE_HOST`: Server bind address (default: "0.0.0.0")
//! - `FLOODGATE_PORT`: Server port (default: "3000")
//! - `FLOODGATE_UPSTREAM_URL`: Base URL admitted requests are forwarded to (default: "http://127.0.0.1:8080")
//!
//! ## Logging Configuration
//! - `RUST_LOG`: Standard Rust logging configuration
//! - `FLOODGATE_LOG_LEVEL`: Application-specific log level override
//!
//! ## Deduplication Configuration
//! - `FLOODGATE_DEDUP_ENABLED`: Enable request deduplication (default: "true")
//! - `FLOODGATE_DEDUP_TTL_SECONDS`: Follower wait bound in seconds (default: "5.0")
//! - `FLOODGATE_DEDUP_MAX_PENDING`: Distinct in-flight signatures tracked (default: "1000")
//! - `FLOODGATE_DEDUP_GRACE_MS`: Visibility window after a leader completes (default: "50")
//! - `FLOODGATE_DEDUP_PATH_PREFIXES`: Comma-separated inclusion list (optional)
//! - `FLOODGATE_DEDUP_EXCLUDED_PATHS`: Comma-separated exclusion list
//!
//! ## Signature Configuration
//! - `FLOODGATE_SIGNATURE_HEADERS`: Comma-separated header allow-list (default: "content-type,accept,x-api-key")
//! - `FLOODGATE_SIGNATURE_MAX_BODY_BYTES`: Largest body buffered for signing (default: "10485760")
//!
//! ## Rate Limiting Configuration
//! - `FLOODGATE_RATE_LIMIT_ENABLED`: Enable rate limiting (default: "true")
//! - `FLOODGATE_RATE_LIMIT_REQUESTS`: Requests allowed per window (default: "60")
//! - `FLOODGATE_RATE_LIMIT_WINDOW_SECONDS`: Window length (default: "60")
//! - `FLOODGATE_RATE_LIMIT_MAX_CLIENTS`: Hard cap on tracked clients (default: "10000")
//! - `FLOODGATE_RATE_LIMIT_CLEANUP_INTERVAL`: Checks between eviction sweeps (default: "1000")
//! - `FLOODGATE_TRUST_FORWARDED_FOR`: Use the first `X-Forwarded-For` entry as client id (default: "true")
//!
//! # Usage
//!
//! ```rust,no_run
//! use floodgate::env::{validate_environment, get_config};
//!
//! // Validate all environment variables at startup
//! let validation_result = validate_environment();
//! if let Err(errors) = validation_result {
//!     for error in errors {
//!         eprintln!("Environment validation error: {}: {}", error.variable, error.message);
//!     }
//!     std::process::exit(1);
//! }
//!
//! // Get validated configuration
//! let config = get_config();
//! println!("Server will bind to {}:{}", config.host, config.port);
//! ```

use crate::admission::config::{
    AdmissionConfig, DEFAULT_CLEANUP_INTERVAL_CHECKS, DEFAULT_DEDUP_GRACE_MS,
    DEFAULT_DEDUP_TTL_SECONDS, DEFAULT_MAX_PENDING_SIGNATURES, DEFAULT_MAX_TRACKED_CLIENTS,
    DEFAULT_REQUESTS_PER_WINDOW, DEFAULT_WINDOW_SECONDS, DedupConfig, RateLimitConfig,
    SignatureConfig, default_excluded_paths,
};
use crate::signature::DEFAULT_MAX_SIGNATURE_BODY_BYTES;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use tracing::{info, warn};

pub const DEFAULT_LOG_LEVEL: &str = "floodgate=info,tower_http=debug";
pub const DEFAULT_UPSTREAM_URL: &str = "http://127.0.0.1:8080";

/// Environment validation errors
#[derive(Debug, Clone)]
pub struct EnvValidationError {
    pub variable: String,
    pub message: String,
    pub severity: ErrorSeverity,
}

/// Severity level for environment validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorSeverity {
    /// Critical errors that prevent application startup
    Critical,
    /// Warnings about malformed values replaced by defaults
    Warning,
    /// Informational messages about default values being used
    Info,
}

/// Validated application configuration derived from environment variables
#[derive(Debug, Clone)]
pub struct AppConfig {
    // Server
    pub host: String,
    pub port: u16,
    pub bind_address: SocketAddr,
    pub upstream_url: String,

    // Logging
    pub log_level: String,

    // Admission
    pub admission: AdmissionConfig,
}

/// Validate all environment variables and return configuration or errors
pub fn validate_environment() -> Result<AppConfig, Vec<EnvValidationError>> {
    validate_with(|name| std::env::var(name).ok())
}

/// Validate configuration read through `lookup` instead of the process environment
pub fn validate_with<F>(lookup: F) -> Result<AppConfig, Vec<EnvValidationError>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    // Server configuration
    let host = lookup("FLOODGATE_HOST").unwrap_or_else(|| {
        warnings.push(info_default("FLOODGATE_HOST", "Using default host '0.0.0.0'"));
        "0.0.0.0".to_string()
    });

    if IpAddr::from_str(&host).is_err() {
        errors.push(EnvValidationError {
            variable: "FLOODGATE_HOST".to_string(),
            message: format!("Invalid IP address: {}", host),
            severity: ErrorSeverity::Critical,
        });
    }

    let port = match lookup("FLOODGATE_PORT") {
        Some(port_str) => match port_str.parse::<u16>() {
            Ok(port) => {
                if port < 1024 && port != 0 {
                    warnings.push(EnvValidationError {
                        variable: "FLOODGATE_PORT".to_string(),
                        message: format!(
                            "Using privileged port {}, may require root privileges",
                            port
                        ),
                        severity: ErrorSeverity::Warning,
                    });
                }
                port
            }
            Err(_) => {
                errors.push(EnvValidationError {
                    variable: "FLOODGATE_PORT".to_string(),
                    message: format!("Invalid port number: {}", port_str),
                    severity: ErrorSeverity::Critical,
                });
                3000
            }
        },
        None => {
            warnings.push(info_default("FLOODGATE_PORT", "Using default port 3000"));
            3000
        }
    };

    let bind_address = SocketAddr::new(
        IpAddr::from_str(&host).unwrap_or(IpAddr::from([0, 0, 0, 0])),
        port,
    );

    let upstream_url = lookup("FLOODGATE_UPSTREAM_URL").unwrap_or_else(|| {
        warnings.push(info_default(
            "FLOODGATE_UPSTREAM_URL",
            &format!("Using default upstream '{}'", DEFAULT_UPSTREAM_URL),
        ));
        DEFAULT_UPSTREAM_URL.to_string()
    });

    if !(upstream_url.starts_with("http://") || upstream_url.starts_with("https://")) {
        errors.push(EnvValidationError {
            variable: "FLOODGATE_UPSTREAM_URL".to_string(),
            message: format!("Upstream URL must start with http:// or https://, got '{}'", upstream_url),
            severity: ErrorSeverity::Critical,
        });
    }

    // Logging configuration
    let log_level = lookup("FLOODGATE_LOG_LEVEL")
        .or_else(|| lookup("RUST_LOG"))
        .unwrap_or_else(|| {
            warnings.push(info_default(
                "RUST_LOG/FLOODGATE_LOG_LEVEL",
                &format!("Using default log level '{}'", DEFAULT_LOG_LEVEL),
            ));
            DEFAULT_LOG_LEVEL.to_string()
        });

    // Deduplication configuration
    let dedup = DedupConfig {
        enabled: parse_bool_with_default(&lookup, "FLOODGATE_DEDUP_ENABLED", true, &mut warnings),
        ttl_seconds: parse_with_default(
            &lookup,
            "FLOODGATE_DEDUP_TTL_SECONDS",
            DEFAULT_DEDUP_TTL_SECONDS,
            &mut warnings,
        ),
        max_pending_signatures: parse_with_default(
            &lookup,
            "FLOODGATE_DEDUP_MAX_PENDING",
            DEFAULT_MAX_PENDING_SIGNATURES,
            &mut warnings,
        ),
        grace_ms: parse_with_default(&lookup, "FLOODGATE_DEDUP_GRACE_MS", DEFAULT_DEDUP_GRACE_MS, &mut warnings),
        enabled_path_prefixes: lookup("FLOODGATE_DEDUP_PATH_PREFIXES")
            .map(|value| split_list(&value))
            .filter(|prefixes| !prefixes.is_empty()),
        excluded_paths: lookup("FLOODGATE_DEDUP_EXCLUDED_PATHS")
            .map(|value| split_list(&value))
            .unwrap_or_else(default_excluded_paths),
    };

    // Signature configuration
    let signature = SignatureConfig {
        header_allow_list: lookup("FLOODGATE_SIGNATURE_HEADERS")
            .map(|value| split_list(&value))
            .unwrap_or_else(|| SignatureConfig::default().header_allow_list),
        max_body_bytes: parse_with_default(
            &lookup,
            "FLOODGATE_SIGNATURE_MAX_BODY_BYTES",
            DEFAULT_MAX_SIGNATURE_BODY_BYTES,
            &mut warnings,
        ),
    };

    // Rate limiting configuration
    let rate_limiting = RateLimitConfig {
        enabled: parse_bool_with_default(&lookup, "FLOODGATE_RATE_LIMIT_ENABLED", true, &mut warnings),
        requests_per_window: parse_with_default(
            &lookup,
            "FLOODGATE_RATE_LIMIT_REQUESTS",
            DEFAULT_REQUESTS_PER_WINDOW,
            &mut warnings,
        ),
        window_seconds: parse_with_default(
            &lookup,
            "FLOODGATE_RATE_LIMIT_WINDOW_SECONDS",
            DEFAULT_WINDOW_SECONDS,
            &mut warnings,
        ),
        max_tracked_clients: parse_with_default(
            &lookup,
            "FLOODGATE_RATE_LIMIT_MAX_CLIENTS",
            DEFAULT_MAX_TRACKED_CLIENTS,
            &mut warnings,
        ),
        cleanup_interval_checks: parse_with_default(
            &lookup,
            "FLOODGATE_RATE_LIMIT_CLEANUP_INTERVAL",
            DEFAULT_CLEANUP_INTERVAL_CHECKS,
            &mut warnings,
        ),
        trust_forwarded_for: parse_bool_with_default(
            &lookup,
            "FLOODGATE_TRUST_FORWARDED_FOR",
            true,
            &mut warnings,
        ),
    };

    let admission = AdmissionConfig {
        dedup,
        signature,
        rate_limiting,
    };

    if let Err(e) = admission.validate() {
        errors.push(EnvValidationError {
            variable: "FLOODGATE_DEDUP_*/FLOODGATE_SIGNATURE_*/FLOODGATE_RATE_LIMIT_*".to_string(),
            message: e.to_string(),
            severity: ErrorSeverity::Critical,
        });
    }

    // Add all warnings to errors for reporting
    errors.extend(warnings);

    let has_critical_errors = errors.iter().any(|e| e.severity == ErrorSeverity::Critical);
    if has_critical_errors {
        return Err(errors);
    }

    // Log non-critical issues
    for error in &errors {
        match error.severity {
            ErrorSeverity::Warning => warn!("{}: {}", error.variable, error.message),
            ErrorSeverity::Info => info!("{}: {}", error.variable, error.message),
            ErrorSeverity::Critical => {}
        }
    }

    Ok(AppConfig {
        host,
        port,
        bind_address,
        upstream_url,
        log_level,
        admission,
    })
}

/// Get the validated configuration, exiting the process if validation fails
pub fn get_config() -> AppConfig {
    match validate_environment() {
        Ok(config) => config,
        Err(errors) => {
            eprintln!("Environment validation failed:");
            for error in errors {
                match error.severity {
                    ErrorSeverity::Critical => {
                        eprintln!("CRITICAL - {}: {}", error.variable, error.message)
                    }
                    ErrorSeverity::Warning => {
                        eprintln!("WARNING - {}: {}", error.variable, error.message)
                    }
                    ErrorSeverity::Info => {
                        eprintln!("INFO - {}: {}", error.variable, error.message)
                    }
                }
            }
            std::process::exit(1);
        }
    }
}

/// Print environment validation results in a user-friendly format
pub fn print_validation_results(result: &Result<AppConfig, Vec<EnvValidationError>>) {
    match result {
        Ok(config) => {
            println!("Environment validation successful");
            println!("Configuration:");
            println!("  Server: {}", config.bind_address);
            println!("  Upstream: {}", config.upstream_url);
            println!("  Log Level: {}", config.log_level);
            println!("  Admission: {}", config.admission.summary());
            if let Some(prefixes) = &config.admission.dedup.enabled_path_prefixes {
                println!("  Dedup Path Prefixes: {}", prefixes.join(","));
            }
            println!(
                "  Dedup Excluded Paths: {}",
                config.admission.dedup.excluded_paths.join(",")
            );
            println!(
                "  Signature Headers: {}",
                config.admission.signature.header_allow_list.join(",")
            );
        }
        Err(errors) => {
            let critical_count = errors
                .iter()
                .filter(|e| e.severity == ErrorSeverity::Critical)
                .count();
            let warning_count = errors
                .iter()
                .filter(|e| e.severity == ErrorSeverity::Warning)
                .count();
            let info_count = errors
                .iter()
                .filter(|e| e.severity == ErrorSeverity::Info)
                .count();

            eprintln!(
                "Environment validation failed with {} critical error(s), {} warning(s), {} info message(s):",
                critical_count, warning_count, info_count
            );

            for error in errors {
                let prefix = match error.severity {
                    ErrorSeverity::Critical => "❌ CRITICAL",
                    ErrorSeverity::Warning => "⚠️  WARNING",
                    ErrorSeverity::Info => "ℹ️  INFO",
                };
                eprintln!("  {} - {}: {}", prefix, error.variable, error.message);
            }
        }
    }
}

/// Generate example environment configuration file
pub fn generate_env_example() -> String {
    format!(
        r#"# Floodgate Environment Configuration
# Copy this file to .env and customize the values for your deployment

# =============================================================================
# Server Configuration
# =============================================================================

# Server bind address
# Default: 0.0.0.0 (bind to all interfaces)
FLOODGATE_HOST=0.0.0.0

# Server port
# Default: 3000
FLOODGATE_PORT=3000

# Base URL admitted requests are forwarded to
FLOODGATE_UPSTREAM_URL={upstream}

# =============================================================================
# Logging Configuration
# =============================================================================

# Default: {log_level}
# Examples:
#   RUST_LOG=debug                              # Everything at debug level
#   FLOODGATE_LOG_LEVEL=floodgate=debug         # Takes precedence over RUST_LOG
RUST_LOG={log_level}

# =============================================================================
# Deduplication Configuration
# =============================================================================

FLOODGATE_DEDUP_ENABLED=true

# How long a duplicate waits for the leader before running on its own
FLOODGATE_DEDUP_TTL_SECONDS={ttl}

# Distinct in-flight signatures; beyond this new requests skip deduplication
FLOODGATE_DEDUP_MAX_PENDING={max_pending}

# How long a finished response stays visible to late duplicates
FLOODGATE_DEDUP_GRACE_MS={grace}

# Only deduplicate under these prefixes, regardless of method
# FLOODGATE_DEDUP_PATH_PREFIXES=/v1/chat/,/memory/

# Never deduplicate these paths
FLOODGATE_DEDUP_EXCLUDED_PATHS={excluded}

# =============================================================================
# Signature Configuration
# =============================================================================

# Headers that distinguish otherwise identical requests
FLOODGATE_SIGNATURE_HEADERS=content-type,accept,x-api-key

# Bodies larger than this are not buffered and skip deduplication
FLOODGATE_SIGNATURE_MAX_BODY_BYTES={max_body}

# =============================================================================
# Rate Limiting Configuration
# =============================================================================

FLOODGATE_RATE_LIMIT_ENABLED=true
FLOODGATE_RATE_LIMIT_REQUESTS={requests}
FLOODGATE_RATE_LIMIT_WINDOW_SECONDS={window}

# Hard cap on tracked clients; least recently seen are evicted first
FLOODGATE_RATE_LIMIT_MAX_CLIENTS={max_clients}

# Run the eviction sweep every N checks
FLOODGATE_RATE_LIMIT_CLEANUP_INTERVAL={cleanup}

# Only enable behind a proxy that sets X-Forwarded-For
FLOODGATE_TRUST_FORWARDED_FOR=true
"#,
        upstream = DEFAULT_UPSTREAM_URL,
        log_level = DEFAULT_LOG_LEVEL,
        ttl = DEFAULT_DEDUP_TTL_SECONDS,
        max_pending = DEFAULT_MAX_PENDING_SIGNATURES,
        grace = DEFAULT_DEDUP_GRACE_MS,
        excluded = default_excluded_paths().join(","),
        max_body = DEFAULT_MAX_SIGNATURE_BODY_BYTES,
        requests = DEFAULT_REQUESTS_PER_WINDOW,
        window = DEFAULT_WINDOW_SECONDS,
        max_clients = DEFAULT_MAX_TRACKED_CLIENTS,
        cleanup = DEFAULT_CLEANUP_INTERVAL_CHECKS,
    )
}

fn info_default(var_name: &str, message: &str) -> EnvValidationError {
    EnvValidationError {
        variable: var_name.to_string(),
        message: message.to_string(),
        severity: ErrorSeverity::Info,
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

/// Helper function to parse a variable with a default value
fn parse_with_default<F, T>(
    lookup: &F,
    var_name: &str,
    default: T,
    warnings: &mut Vec<EnvValidationError>,
) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Clone + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    match lookup(var_name) {
        Some(value_str) => match value_str.trim().parse::<T>() {
            Ok(value) => value,
            Err(e) => {
                warnings.push(EnvValidationError {
                    variable: var_name.to_string(),
                    message: format!(
                        "Invalid value '{}': {}. Using default: {}",
                        value_str, e, default
                    ),
                    severity: ErrorSeverity::Warning,
                });
                default
            }
        },
        None => {
            warnings.push(info_default(
                var_name,
                &format!("Using default value: {}", default),
            ));
            default
        }
    }
}

/// Helper function to parse a boolean variable with a default value
fn parse_bool_with_default<F>(
    lookup: &F,
    var_name: &str,
    default: bool,
    warnings: &mut Vec<EnvValidationError>,
) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(var_name) {
        Some(value_str) => match value_str.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => true,
            "false" | "0" | "no" | "off" => false,
            _ => {
                warnings.push(EnvValidationError {
                    variable: var_name.to_string(),
                    message: format!(
                        "Invalid boolean value '{}'. Using default: {}",
                        value_str, default
                    ),
                    severity: ErrorSeverity::Warning,
                });
                default
            }
        },
        None => {
            warnings.push(info_default(
                var_name,
                &format!("Using default value: {}", default),
            ));
            default
        }
    }
}
