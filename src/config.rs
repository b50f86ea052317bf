use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use config as cfg;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing_subscriber::filter::LevelFilter;

use crate::{changer::magazine::UUID_PREFIX, utils::lock::default_lock_dir};

const DEFAULT_SPOOL: &str = "/var/spool/vchanger";
const DEFAULT_POOL: &str = "Scratch";
const DEFAULT_LOG_LEVEL: LevelFilter = LevelFilter::WARN;

#[derive(Debug, Clone)]
pub struct Config {
    pub changer: ChangerConfig,
    pub log: LogConfig,
    pub bconsole: BconsoleConfig,
}

#[derive(Debug, Clone)]
pub struct ChangerConfig {
    pub storage_name: String,
    pub work_dir: PathBuf,
    /// Magazine specs in bay order: a directory path or `UUID:<fs-uuid>`.
    pub magazines: Vec<String>,
    pub default_pool: String,
    pub lock_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub file: Option<PathBuf>,
    pub level: LevelFilter,
}

#[derive(Debug, Clone, Default)]
pub struct BconsoleConfig {
    pub program: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let raw: RawConfig = cfg::Config::builder()
            .add_source(cfg::File::from(path).format(cfg::FileFormat::Toml))
            .build()
            .with_context(|| format!("load {}", path.display()))?
            .try_deserialize()
            .with_context(|| format!("deserialize {}", path.display()))?;

        let n = config_helpers::Normalizer { base_dir };

        let storage_name = n
            .trim_opt(raw.changer.storage_name)
            .context("[changer] storage_name must be set")?;
        if !Self::valid_name(&storage_name) {
            bail!(
                "bad storage_name '{}': use [A-Za-z0-9_.-], length 1..64",
                storage_name
            );
        }
        let work_dir = n
            .trim_opt(raw.changer.work_dir)
            .map(|s| n.resolve(&s))
            .unwrap_or_else(|| Path::new(DEFAULT_SPOOL).join(&storage_name));
        let magazines = Self::build_magazines(&n, raw.changer.magazines.unwrap_or_default())?;
        let default_pool = n
            .trim_opt(raw.changer.default_pool)
            .unwrap_or_else(|| DEFAULT_POOL.to_string());
        let lock_dir = n
            .trim_opt(raw.changer.lock_dir)
            .map(|s| n.resolve(&s))
            .unwrap_or_else(default_lock_dir);

        let level = match n.trim_opt(raw.log.level) {
            Some(s) => s
                .parse::<LevelFilter>()
                .map_err(|_| anyhow::anyhow!("[log] bad level '{s}'"))?,
            None => DEFAULT_LOG_LEVEL,
        };
        let log = LogConfig {
            file: n.trim_opt(raw.log.file).map(|s| n.resolve(&s)),
            level,
        };

        let bconsole = BconsoleConfig {
            program: n.trim_opt(raw.bconsole.program).map(PathBuf::from),
            config: n.trim_opt(raw.bconsole.config).map(|s| n.resolve(&s)),
        };

        Ok(Self {
            changer: ChangerConfig {
                storage_name,
                work_dir,
                magazines,
                default_pool,
                lock_dir,
            },
            log,
            bconsole,
        })
    }

    fn build_magazines(n: &config_helpers::Normalizer<'_>, raw: Vec<String>) -> Result<Vec<String>> {
        let uuid_re = Regex::new(r"^UUID:[0-9A-Fa-f-]+$").context("compile uuid pattern")?;
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(raw.len());
        for (bay, entry) in raw.into_iter().enumerate() {
            let entry = entry.trim();
            if entry.is_empty() {
                bail!("[changer] magazine {} is empty", bay);
            }
            let spec = if entry.starts_with(UUID_PREFIX) {
                if !uuid_re.is_match(entry) {
                    bail!("[changer] bad magazine '{}': expected UUID:<hex-and-dashes>", entry);
                }
                entry.to_string()
            } else {
                n.resolve(entry).display().to_string()
            };
            if !seen.insert(spec.clone()) {
                bail!("[changer] duplicate magazine '{}'", spec);
            }
            out.push(spec);
        }
        Ok(out)
    }

    #[inline]
    fn valid_name(name: &str) -> bool {
        let len_ok = (1..=64).contains(&name.len());
        len_ok
            && name
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
    }

    pub fn to_toml(&self) -> Result<String> {
        #[derive(Serialize)]
        struct ChangerOut<'a> {
            storage_name: &'a str,
            work_dir: String,
            magazines: &'a [String],
            default_pool: &'a str,
            lock_dir: String,
        }
        #[derive(Serialize)]
        struct LogOut {
            #[serde(skip_serializing_if = "Option::is_none")]
            file: Option<String>,
            level: String,
        }
        #[derive(Serialize)]
        struct BconsoleOut {
            #[serde(skip_serializing_if = "Option::is_none")]
            program: Option<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            config: Option<String>,
        }
        #[derive(Serialize)]
        struct Out<'a> {
            changer: ChangerOut<'a>,
            log: LogOut,
            bconsole: BconsoleOut,
        }

        let c = &self.changer;
        let out = Out {
            changer: ChangerOut {
                storage_name: &c.storage_name,
                work_dir: c.work_dir.display().to_string(),
                magazines: &c.magazines,
                default_pool: &c.default_pool,
                lock_dir: c.lock_dir.display().to_string(),
            },
            log: LogOut {
                file: self.log.file.as_ref().map(|p| p.display().to_string()),
                level: self.log.level.to_string().to_lowercase(),
            },
            bconsole: BconsoleOut {
                program: self.bconsole.program.as_ref().map(|p| p.display().to_string()),
                config: self.bconsole.config.as_ref().map(|p| p.display().to_string()),
            },
        };
        Ok(toml::to_string_pretty(&out)?)
    }
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    changer: RawChanger,

    #[serde(default)]
    log: RawLog,

    #[serde(default)]
    bconsole: RawBconsole,
}

#[derive(Debug, Deserialize)]
struct RawChanger {
    storage_name: Option<String>,
    work_dir: Option<String>,
    magazines: Option<Vec<String>>,
    default_pool: Option<String>,
    lock_dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawLog {
    file: Option<String>,
    level: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawBconsole {
    program: Option<String>,
    config: Option<String>,
}

mod config_helpers {
    use std::path::{Path, PathBuf};

    pub(super) struct Normalizer<'a> {
        pub base_dir: &'a Path,
    }

    impl Normalizer<'_> {
        #[inline]
        pub fn trim_opt(&self, s: Option<String>) -> Option<String> {
            s.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        }

        #[inline]
        pub fn resolve(&self, p: &str) -> PathBuf {
            let pb = PathBuf::from(p.trim());
            if pb.is_absolute() {
                pb
            } else {
                self.base_dir.join(pb)
            }
        }
    }
}
