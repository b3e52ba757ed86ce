//! Repository mirror optimization
//!
//! Points apt at the country mirror closest to the user, makes sure the four
//! standard components are enabled and refreshes the package cache, all in one
//! elevated chain. If that chain fails, a rescue chain restores the backed-up
//! sources file and refreshes again. The rescue runs at most once.
//!
//! Country resolution never fails: IP geolocation, then the locale's territory,
//! then "us".

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::chain::{ChainBuilder, ChainStep, CommandChain};
use crate::command_executor::CommandRunner;
use crate::config::PilotConfig;
use crate::error::{PilotError, ProbeError, Result};
use crate::package_manager::require_verbs;
use crate::transaction::TransactionResult;
use crate::types::{PackageManagerKind, StepTag};

pub const DEFAULT_COUNTRY: &str = "us";

/// Components that must be enabled for driver packages to resolve
pub const STANDARD_COMPONENTS: [&str; 4] = ["main", "restricted", "universe", "multiverse"];

/// Suffix appended to the sources file for the pre-rewrite copy
pub const BACKUP_SUFFIX: &str = ".backup_gpupilot";

/// Locale variables consulted, highest precedence first
const LOCALE_VARS: [&str; 3] = ["LC_ALL", "LC_MESSAGES", "LANG"];

/// Lowercase two-letter ISO 3166 country code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CountryCode(String);

impl CountryCode {
    pub fn parse(raw: &str) -> Result<Self> {
        let code = raw.trim();
        if code.len() == 2 && code.chars().all(|c| c.is_ascii_alphabetic()) {
            Ok(Self(code.to_ascii_lowercase()))
        } else {
            Err(PilotError::InvalidCountryCode(raw.to_string()))
        }
    }

    pub fn default_code() -> Self {
        Self(DEFAULT_COUNTRY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    #[serde(rename = "countryCode")]
    country_code: Option<String>,
}

/// Extract `countryCode` from an ip-api style JSON body.
pub fn parse_geolocation(body: &str) -> std::result::Result<CountryCode, ProbeError> {
    let response: GeoResponse = serde_json::from_str(body)
        .map_err(|_| ProbeError::unparseable("geolocation response"))?;
    response
        .country_code
        .and_then(|c| CountryCode::parse(&c).ok())
        .ok_or_else(|| ProbeError::unparseable("countryCode in geolocation response"))
}

/// Territory of a POSIX locale ("tr_TR.UTF-8" → "tr", "de_AT@euro" → "at").
pub fn country_from_locale(locale: &str) -> Option<CountryCode> {
    let (_, rest) = locale.split_once('_')?;
    let territory = rest.split(['.', '@']).next()?;
    CountryCode::parse(territory).ok()
}

/// Apply the fallback order to already-gathered inputs.
pub fn pick_country_code<'a>(
    network: std::result::Result<CountryCode, ProbeError>,
    locales: impl IntoIterator<Item = &'a str>,
) -> CountryCode {
    match network {
        Ok(code) => return code,
        Err(e) => tracing::debug!("Geolocation lookup failed: {}", e),
    }
    locales
        .into_iter()
        .find_map(country_from_locale)
        .unwrap_or_else(CountryCode::default_code)
}

/// Outcome of the primary chain and, if it failed, the rescue chain
#[derive(Debug, Clone)]
pub struct RepoOutcome {
    pub country_code: CountryCode,
    pub primary: TransactionResult,
    pub rescue: Option<TransactionResult>,
}

impl RepoOutcome {
    /// Primary succeeded, or it failed and the rescue restored the system.
    pub fn succeeded(&self) -> bool {
        match &self.rescue {
            None => self.primary.succeeded,
            Some(rescue) => rescue.succeeded,
        }
    }
}

/// Builds and drives the mirror optimization chains
pub struct RepoOptimizer<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a PilotConfig,
    kind: PackageManagerKind,
}

impl<'a> RepoOptimizer<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a PilotConfig, kind: PackageManagerKind) -> Self {
        Self {
            runner,
            config,
            kind,
        }
    }

    /// Country code by IP geolocation, then locale, then "us".
    pub fn resolve_country_code(&self) -> CountryCode {
        let locales: Vec<String> = LOCALE_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok())
            .collect();
        let code = pick_country_code(self.lookup_network(), locales.iter().map(String::as_str));
        tracing::info!("Mirror country resolved: {}", code.as_str().to_uppercase());
        code
    }

    fn lookup_network(&self) -> std::result::Result<CountryCode, ProbeError> {
        if !self.runner.tool_available("curl") {
            return Err(ProbeError::ToolMissing("curl".to_string()));
        }
        let command = format!(
            "curl -s --max-time {} {}",
            self.config.geolocation_timeout_secs,
            crate::chain::shell_quote(&self.config.geolocation_url)
        );
        let body = self
            .runner
            .run(&command)
            .ok_or_else(|| ProbeError::command_failed(&command))?;
        parse_geolocation(&body)
    }

    pub fn backup_path(&self) -> String {
        format!("{}{}", self.config.sources_list, BACKUP_SUFFIX)
    }

    fn sed_expression(&self, code: &CountryCode) -> String {
        let upstream = format!("http://{}{}", self.config.mirror_host, self.config.mirror_path);
        let regional = format!(
            "http://{}.{}{}",
            code, self.config.mirror_host, self.config.mirror_path
        );
        format!("s|{}|{}|g", upstream, regional)
    }

    fn require_apt(&self) -> Result<&'static crate::package_manager::VerbSet> {
        if self.kind != PackageManagerKind::Apt {
            return Err(PilotError::unsupported(format!(
                "repository optimization requires apt (found {})",
                self.kind
            )));
        }
        require_verbs(self.kind)
    }

    /// Backup, mirror rewrite, component enablement and cache refresh.
    pub fn primary_chain(&self, code: &CountryCode) -> Result<CommandChain> {
        let verbs = self.require_apt()?;
        let sources = self.config.sources_list.as_str();

        let mut builder = ChainBuilder::new("Repository optimization");
        for (key, value) in verbs.env {
            builder.env(*key, *value);
        }

        builder
            .push(
                ChainStep::new(StepTag::Backup, "cp")
                    .args([sources, self.backup_path().as_str()])
                    .only_if_file_exists(sources),
            )
            .push(
                ChainStep::new(StepTag::RepoUpdate, "sed")
                    .arg("-i")
                    .arg(self.sed_expression(code))
                    .arg(sources)
                    .only_if_file_exists(sources),
            );

        if !self.runner.tool_available("add-apt-repository") {
            builder.push(verbs.install.step_with(StepTag::PrepareDeps, "software-properties-common"));
        }
        if let Some(enable) = verbs.enable_component {
            builder.extend(
                STANDARD_COMPONENTS
                    .iter()
                    .map(|component| enable.step_with(StepTag::RepoUpdate, component)),
            );
        }
        builder.push(verbs.refresh.step(StepTag::RepoUpdate));

        Ok(builder.freeze())
    }

    /// Restore the backup and refresh again.
    pub fn rescue_chain(&self) -> Result<CommandChain> {
        let verbs = self.require_apt()?;
        let backup = self.backup_path();

        let mut builder = ChainBuilder::new("Repository rescue");
        builder
            .push(
                ChainStep::new(StepTag::Backup, "mv")
                    .args([backup.as_str(), self.config.sources_list.as_str()])
                    .only_if_file_exists(backup.as_str()),
            )
            .push(verbs.refresh.step(StepTag::RepoUpdate));
        Ok(builder.freeze())
    }

    /// Run the primary chain through `execute`; on failure run the rescue
    /// chain once.
    pub fn optimize<F>(&self, code: CountryCode, execute: F) -> Result<RepoOutcome>
    where
        F: FnMut(&CommandChain) -> TransactionResult,
    {
        let primary_chain = self.primary_chain(&code)?;
        self.run_with_rescue(code, &primary_chain, execute)
    }

    /// Like `optimize`, for a primary chain the caller already built.
    pub fn run_with_rescue<F>(
        &self,
        code: CountryCode,
        primary_chain: &CommandChain,
        mut execute: F,
    ) -> Result<RepoOutcome>
    where
        F: FnMut(&CommandChain) -> TransactionResult,
    {
        let rescue_chain = self.rescue_chain()?;

        let primary = execute(primary_chain);
        if primary.succeeded {
            return Ok(RepoOutcome {
                country_code: code,
                primary,
                rescue: None,
            });
        }

        tracing::warn!(
            "Repository chain failed (exit {}), restoring original sources",
            primary.exit_code
        );
        let rescue = execute(&rescue_chain);
        if !rescue.succeeded {
            tracing::error!("Rescue chain failed (exit {})", rescue.exit_code);
        }

        Ok(RepoOutcome {
            country_code: code,
            primary,
            rescue: Some(rescue),
        })
    }
}
