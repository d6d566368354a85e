#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow, bail};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_STAGE_PORT: u16 = 5000;
pub const DEFAULT_STAGE_HOST: &str = "0.0.0.0";
pub const DEFAULT_STAGING_DIR: &str = "static";
pub const DEFAULT_FFMPEG_BIN: &str = "ffmpeg";
pub const DEFAULT_FFMPEG_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_SESSION_TTL_MINUTES: i64 = 720;
pub const DEFAULT_MAX_UPLOAD_MB: usize = 2048;

/// What to do with an uploaded subtitle whose extension is neither canonical
/// nor a known convertible format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnknownSubtitlePolicy {
    /// Drop the file and carry on without a subtitle.
    #[default]
    Skip,
    /// Fail the upload with a visible error.
    Reject,
}

impl UnknownSubtitlePolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "skip" | "ignore" => Some(Self::Skip),
            "reject" | "error" => Some(Self::Reject),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub database_url: String,
    pub database_auth_token: String,
    pub staging_dir: PathBuf,
    pub stage_host: String,
    pub stage_port: u16,
    pub ffmpeg_bin: PathBuf,
    pub ffmpeg_timeout: Duration,
    pub unknown_subtitle_policy: UnknownSubtitlePolicy,
    pub admin_password: Option<String>,
    pub session_ttl: chrono::Duration,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub staging_dir: Option<PathBuf>,
    pub stage_port: Option<u16>,
    pub stage_host: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_runtime_settings(&file_vars, env_var_string, overrides)
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let database_url = lookup("DATABASE_URL").ok_or_else(|| anyhow!("DATABASE_URL not set"))?;
    let database_auth_token = lookup("DATABASE_AUTH_TOKEN").unwrap_or_default();
    let staging_dir = overrides
        .staging_dir
        .or_else(|| lookup("STAGING_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STAGING_DIR));
    let stage_port = overrides
        .stage_port
        .or_else(|| lookup("STAGE_PORT").and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_STAGE_PORT);
    let stage_host = overrides
        .stage_host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("STAGE_HOST"))
        .unwrap_or_else(|| DEFAULT_STAGE_HOST.to_string());
    let ffmpeg_bin = lookup("FFMPEG_BIN")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_FFMPEG_BIN));
    let ffmpeg_timeout_secs = lookup("FFMPEG_TIMEOUT_SECS")
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_FFMPEG_TIMEOUT_SECS);
    let unknown_subtitle_policy = match lookup("UNKNOWN_SUBTITLE_POLICY") {
        Some(raw) => match UnknownSubtitlePolicy::parse(&raw) {
            Some(policy) => policy,
            None => bail!("UNKNOWN_SUBTITLE_POLICY must be `skip` or `reject`, got `{raw}`"),
        },
        None => UnknownSubtitlePolicy::default(),
    };
    let session_ttl_minutes = lookup("SESSION_TTL_MINUTES")
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|minutes| *minutes > 0)
        .unwrap_or(DEFAULT_SESSION_TTL_MINUTES);
    let max_upload_mb = lookup("MAX_UPLOAD_MB")
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|mb| *mb > 0)
        .unwrap_or(DEFAULT_MAX_UPLOAD_MB);

    Ok(RuntimeSettings {
        database_url,
        database_auth_token,
        staging_dir,
        stage_host,
        stage_port,
        ffmpeg_bin,
        ffmpeg_timeout: Duration::from_secs(ffmpeg_timeout_secs),
        unknown_subtitle_policy,
        admin_password: lookup("ADMIN_PASSWORD"),
        session_ttl: chrono::Duration::minutes(session_ttl_minutes),
        max_upload_bytes: max_upload_mb.saturating_mul(1024 * 1024),
    })
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn settings_from(contents: &str) -> RuntimeSettings {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_settings(&vars, |_| None, RuntimeOverrides::default()).unwrap()
    }

    #[test]
    fn defaults_apply_when_only_database_is_set() {
        let settings = settings_from("DATABASE_URL=\"/var/lib/stage/creds.db\"\n");
        assert_eq!(settings.database_url, "/var/lib/stage/creds.db");
        assert_eq!(settings.stage_port, DEFAULT_STAGE_PORT);
        assert_eq!(settings.stage_host, DEFAULT_STAGE_HOST);
        assert_eq!(settings.staging_dir, PathBuf::from(DEFAULT_STAGING_DIR));
        assert_eq!(settings.ffmpeg_bin, PathBuf::from(DEFAULT_FFMPEG_BIN));
        assert_eq!(
            settings.ffmpeg_timeout,
            Duration::from_secs(DEFAULT_FFMPEG_TIMEOUT_SECS)
        );
        assert_eq!(settings.unknown_subtitle_policy, UnknownSubtitlePolicy::Skip);
        assert!(settings.admin_password.is_none());
        assert!(settings.database_auth_token.is_empty());
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let vars = read_env_file(make_config("STAGE_PORT=\"4242\"\n").path()).unwrap();
        let err =
            build_runtime_settings(&vars, |_| None, RuntimeOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }

    #[test]
    fn reads_all_keys_from_file() {
        let settings = settings_from(
            "DATABASE_URL=\"creds.db\"\nSTAGING_DIR=\"/srv/stage\"\nSTAGE_PORT=\"9090\"\n\
             STAGE_HOST=\"127.0.0.1\"\nFFMPEG_BIN=\"/opt/ffmpeg\"\nFFMPEG_TIMEOUT_SECS=\"12\"\n\
             UNKNOWN_SUBTITLE_POLICY=\"reject\"\nADMIN_PASSWORD=\"hunter2\"\n\
             SESSION_TTL_MINUTES=\"5\"\nMAX_UPLOAD_MB=\"3\"\n",
        );
        assert_eq!(settings.staging_dir, PathBuf::from("/srv/stage"));
        assert_eq!(settings.stage_port, 9090);
        assert_eq!(settings.stage_host, "127.0.0.1");
        assert_eq!(settings.ffmpeg_bin, PathBuf::from("/opt/ffmpeg"));
        assert_eq!(settings.ffmpeg_timeout, Duration::from_secs(12));
        assert_eq!(
            settings.unknown_subtitle_policy,
            UnknownSubtitlePolicy::Reject
        );
        assert_eq!(settings.admin_password.as_deref(), Some("hunter2"));
        assert_eq!(settings.session_ttl, chrono::Duration::minutes(5));
        assert_eq!(settings.max_upload_bytes, 3 * 1024 * 1024);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let settings = settings_from(
            "DATABASE_URL=\"creds.db\"\nSTAGE_PORT=\"nope\"\nFFMPEG_TIMEOUT_SECS=\"0\"\n\
             SESSION_TTL_MINUTES=\"-3\"\n",
        );
        assert_eq!(settings.stage_port, DEFAULT_STAGE_PORT);
        assert_eq!(
            settings.ffmpeg_timeout,
            Duration::from_secs(DEFAULT_FFMPEG_TIMEOUT_SECS)
        );
        assert_eq!(
            settings.session_ttl,
            chrono::Duration::minutes(DEFAULT_SESSION_TTL_MINUTES)
        );
    }

    #[test]
    fn unknown_policy_value_is_rejected() {
        let vars = read_env_file(
            make_config("DATABASE_URL=\"creds.db\"\nUNKNOWN_SUBTITLE_POLICY=\"maybe\"\n").path(),
        )
        .unwrap();
        let err =
            build_runtime_settings(&vars, |_| None, RuntimeOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("UNKNOWN_SUBTITLE_POLICY"));
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("DATABASE_URL=\"file.db\"\n").path()).unwrap();
        let settings = build_runtime_settings(
            &vars,
            |key| (key == "DATABASE_URL").then(|| "libsql://remote".to_string()),
            RuntimeOverrides::default(),
        )
        .unwrap();
        assert_eq!(settings.database_url, "libsql://remote");
    }

    #[test]
    fn overrides_win_over_env_and_file() {
        let mut vars = HashMap::new();
        vars.insert("DATABASE_URL".to_string(), "creds.db".to_string());
        vars.insert("STAGING_DIR".to_string(), "/file-stage".to_string());
        vars.insert("STAGE_HOST".to_string(), "file-host".to_string());

        let settings = build_runtime_settings(
            &vars,
            |key| (key == "STAGE_PORT").then(|| "8000".to_string()),
            RuntimeOverrides {
                staging_dir: Some(PathBuf::from("/override-stage")),
                stage_port: Some(9000),
                stage_host: Some("override-host".into()),
                env_path: None,
            },
        )
        .unwrap();

        assert_eq!(settings.staging_dir, PathBuf::from("/override-stage"));
        assert_eq!(settings.stage_port, 9000);
        assert_eq!(settings.stage_host, "override-host");
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let vars = read_env_file(make_config("DATABASE_URL=\"creds.db\"\n").path()).unwrap();
        let settings = build_runtime_settings(
            &vars,
            |_| None,
            RuntimeOverrides {
                stage_host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(settings.stage_host, DEFAULT_STAGE_HOST);
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export DATABASE_URL="creds.db"
            STAGING_DIR='/stage'
            STAGE_HOST =  "0.0.0.0"
            STAGE_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("DATABASE_URL").unwrap(), "creds.db");
        assert_eq!(vars.get("STAGING_DIR").unwrap(), "/stage");
        assert_eq!(vars.get("STAGE_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("STAGE_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn policy_parse_accepts_aliases() {
        assert_eq!(
            UnknownSubtitlePolicy::parse(" Reject "),
            Some(UnknownSubtitlePolicy::Reject)
        );
        assert_eq!(
            UnknownSubtitlePolicy::parse("ignore"),
            Some(UnknownSubtitlePolicy::Skip)
        );
        assert_eq!(UnknownSubtitlePolicy::parse("later"), None);
    }
}
