//! Package manager adapter
//!
//! Maps the distribution identity from `/etc/os-release` to a package manager
//! family, and each family to a static table of verb templates. Orchestration
//! code asks for a verb ("purge NVIDIA packages") and gets a `ChainStep` back;
//! it never branches on the package manager itself.
//!
//! # Design
//!
//! - **Pure**: nothing in this module spawns processes or touches the disk
//!   except `OsRelease::load`, which reads through the `CommandRunner`
//! - **Data, not code**: adding a distribution means adding a `VerbSet` value
//! - **`none` has no verbs**: `verbs(PackageManagerKind::None)` is `None` and
//!   callers must refuse the operation as unsupported

use std::collections::HashMap;
use std::path::Path;

use crate::chain::{ChainStep, Word};
use crate::command_executor::CommandRunner;
use crate::error::{PilotError, ProbeError, Result};
use crate::types::{PackageManagerKind, StepTag};

pub const OS_RELEASE_PATH: &str = "/etc/os-release";

// ============================================================================
// Distribution identity
// ============================================================================

/// Parsed `/etc/os-release`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OsRelease {
    fields: HashMap<String, String>,
}

impl OsRelease {
    /// Parse `KEY=value` lines; surrounding quotes are stripped from values.
    pub fn parse(content: &str) -> Self {
        let fields = content
            .lines()
            .filter_map(|line| line.trim().split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().trim_matches('"').to_string()))
            .collect();
        Self { fields }
    }

    pub fn load(runner: &dyn CommandRunner) -> std::result::Result<Self, ProbeError> {
        let content = runner.read_file(Path::new(OS_RELEASE_PATH))?;
        let parsed = Self::parse(&content);
        if parsed.fields.is_empty() {
            return Err(ProbeError::unparseable(OS_RELEASE_PATH));
        }
        Ok(parsed)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// `ID`, defaulting to "linux"
    pub fn id(&self) -> &str {
        self.get("ID").unwrap_or("linux")
    }

    pub fn pretty_name(&self) -> Option<&str> {
        self.get("PRETTY_NAME")
    }

    pub fn version_id(&self) -> Option<&str> {
        self.get("VERSION_ID")
    }

    pub fn package_manager(&self) -> PackageManagerKind {
        package_manager_for(self.id())
    }
}

/// Map a distribution `ID` to its package manager family.
pub fn package_manager_for(distro_id: &str) -> PackageManagerKind {
    match distro_id.trim().to_ascii_lowercase().as_str() {
        "ubuntu" | "debian" | "linuxmint" | "pop" => PackageManagerKind::Apt,
        "fedora" | "rhel" | "centos" => PackageManagerKind::Dnf,
        "arch" | "manjaro" | "endeavouros" => PackageManagerKind::Pacman,
        "opensuse" | "sles" => PackageManagerKind::Zypper,
        _ => PackageManagerKind::None,
    }
}

/// Detect the host package manager. An unreadable os-release maps to `None`.
pub fn detect_package_manager(runner: &dyn CommandRunner) -> PackageManagerKind {
    match OsRelease::load(runner) {
        Ok(os) => {
            let kind = os.package_manager();
            tracing::debug!("Distribution '{}' uses package manager: {}", os.id(), kind);
            kind
        }
        Err(e) => {
            tracing::warn!("Could not identify distribution: {}", e);
            PackageManagerKind::None
        }
    }
}

// ============================================================================
// Driver versions
// ============================================================================

/// A driver version that is safe to splice into a package name
///
/// Only ASCII digits and dots are accepted ("535", "550.54").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriverVersion(String);

impl DriverVersion {
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        let valid = !trimmed.is_empty()
            && trimmed.starts_with(|c: char| c.is_ascii_digit())
            && trimmed.chars().all(|c| c.is_ascii_digit() || c == '.');
        if valid {
            Ok(Self(trimmed.to_string()))
        } else {
            Err(PilotError::InvalidVersion(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DriverVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Verb templates
// ============================================================================

/// One token of a verb template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    /// Quoted literal word
    Lit(&'static str),
    /// Unquoted word (glob or command substitution)
    Raw(&'static str),
    /// `prefix + parameter + suffix` as one quoted word; skipped without a parameter
    Param {
        prefix: &'static str,
        suffix: &'static str,
    },
}

/// A command template: program first, then arguments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerbTemplate {
    pub tokens: &'static [Token],
    /// Failure of this verb must not abort the chain (e.g. purging a package
    /// that is not installed on pacman)
    pub tolerate_failure: bool,
}

impl VerbTemplate {
    const fn new(tokens: &'static [Token]) -> Self {
        Self {
            tokens,
            tolerate_failure: false,
        }
    }

    const fn tolerant(tokens: &'static [Token]) -> Self {
        Self {
            tokens,
            tolerate_failure: true,
        }
    }

    /// Returns true if the template has a `Param` slot.
    pub fn is_parameterized(&self) -> bool {
        self.tokens.iter().any(|t| matches!(t, Token::Param { .. }))
    }

    /// Build a step without a parameter. `Param` tokens are dropped.
    pub fn step(&self, tag: StepTag) -> ChainStep {
        self.build(tag, None)
    }

    /// Build a step, filling every `Param` token with `param`.
    pub fn step_with(&self, tag: StepTag, param: &str) -> ChainStep {
        self.build(tag, Some(param))
    }

    fn build(&self, tag: StepTag, param: Option<&str>) -> ChainStep {
        let mut words = self.tokens.iter().filter_map(|token| match *token {
            Token::Lit(s) => Some(Word::Literal(s.to_string())),
            Token::Raw(s) => Some(Word::Raw(s.to_string())),
            Token::Param { prefix, suffix } => {
                param.map(|p| Word::Literal(format!("{}{}{}", prefix, p, suffix)))
            }
        });

        let program = match words.next() {
            Some(Word::Literal(p)) | Some(Word::Raw(p)) => p,
            None => String::new(),
        };
        let step = words.fold(ChainStep::new(tag, program), ChainStep::word);
        if self.tolerate_failure {
            step.tolerate_failure()
        } else {
            step
        }
    }
}

/// Every verb the orchestrator needs from one package manager family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerbSet {
    pub kind: PackageManagerKind,
    /// Refresh package metadata
    pub refresh: VerbTemplate,
    /// Run `refresh` ahead of build dependencies in install chains
    pub refresh_before_install: bool,
    /// Compiler toolchain and kernel headers for DKMS/akmod builds
    pub build_deps: VerbTemplate,
    /// NVIDIA closed driver, versioned where the family supports it
    pub proprietary: VerbTemplate,
    /// NVIDIA closed driver, version chosen by the distribution's tooling
    pub proprietary_auto: VerbTemplate,
    /// NVIDIA open kernel module variant
    pub open_kernel: VerbTemplate,
    pub amd_mesa: VerbTemplate,
    /// Remove every NVIDIA package
    pub purge_nvidia: VerbTemplate,
    /// Remove other vendor stacks installed outside the distribution
    pub purge_extra: Option<VerbTemplate>,
    pub autoremove: Option<VerbTemplate>,
    /// Reinstall the nouveau X driver
    pub restore_nouveau: VerbTemplate,
    /// Regenerate the early-boot image
    pub initramfs: VerbTemplate,
    /// Enable an extra repository component (apt only)
    pub enable_component: Option<VerbTemplate>,
    /// Install one named package
    pub install: VerbTemplate,
    /// Exported for every step of a chain using this manager
    pub env: &'static [(&'static str, &'static str)],
}

use Token::{Lit, Param, Raw};

static APT: VerbSet = VerbSet {
    kind: PackageManagerKind::Apt,
    refresh: VerbTemplate::new(&[Lit("apt-get"), Lit("update")]),
    refresh_before_install: true,
    build_deps: VerbTemplate::new(&[
        Lit("apt-get"),
        Lit("install"),
        Lit("-y"),
        Lit("build-essential"),
        Raw("linux-headers-$(uname -r)"),
    ]),
    proprietary: VerbTemplate::new(&[
        Lit("apt-get"),
        Lit("install"),
        Lit("-y"),
        Param {
            prefix: "nvidia-driver-",
            suffix: "",
        },
        Lit("nvidia-settings"),
    ]),
    proprietary_auto: VerbTemplate::new(&[Lit("ubuntu-drivers"), Lit("autoinstall")]),
    open_kernel: VerbTemplate::new(&[
        Lit("apt-get"),
        Lit("install"),
        Lit("-y"),
        Param {
            prefix: "nvidia-driver-",
            suffix: "-open",
        },
        Lit("nvidia-settings"),
    ]),
    amd_mesa: VerbTemplate::new(&[
        Lit("apt-get"),
        Lit("install"),
        Lit("-y"),
        Lit("xserver-xorg-video-amdgpu"),
        Lit("mesa-vulkan-drivers"),
        Lit("mesa-utils"),
    ]),
    purge_nvidia: VerbTemplate::new(&[
        Lit("apt-get"),
        Lit("remove"),
        Lit("--purge"),
        Lit("-y"),
        Lit("^nvidia-.*"),
        Lit("^libnvidia-.*"),
        Lit("^xserver-xorg-video-nvidia.*"),
    ]),
    // AMDGPU-PRO is rarely installed
    purge_extra: Some(VerbTemplate::tolerant(&[
        Lit("apt-get"),
        Lit("remove"),
        Lit("--purge"),
        Lit("-y"),
        Lit("^amdgpu-pro.*"),
    ])),
    autoremove: Some(VerbTemplate::new(&[Lit("apt-get"), Lit("autoremove"), Lit("-y")])),
    restore_nouveau: VerbTemplate::new(&[
        Lit("apt-get"),
        Lit("install"),
        Lit("-y"),
        Lit("xserver-xorg-video-nouveau"),
    ]),
    initramfs: VerbTemplate::new(&[Lit("update-initramfs"), Lit("-u")]),
    enable_component: Some(VerbTemplate::new(&[
        Lit("add-apt-repository"),
        Lit("-y"),
        Param {
            prefix: "",
            suffix: "",
        },
    ])),
    install: VerbTemplate::new(&[
        Lit("apt-get"),
        Lit("install"),
        Lit("-y"),
        Param {
            prefix: "",
            suffix: "",
        },
    ]),
    env: &[("DEBIAN_FRONTEND", "noninteractive")],
};

static DNF: VerbSet = VerbSet {
    kind: PackageManagerKind::Dnf,
    refresh: VerbTemplate::new(&[Lit("dnf"), Lit("makecache")]),
    refresh_before_install: false,
    build_deps: VerbTemplate::new(&[
        Lit("dnf"),
        Lit("install"),
        Lit("-y"),
        Lit("kernel-devel"),
        Lit("kernel-headers"),
        Lit("gcc"),
        Lit("make"),
    ]),
    // akmod tracks the current driver branch; no versioned package names
    proprietary: VerbTemplate::new(&[
        Lit("dnf"),
        Lit("install"),
        Lit("-y"),
        Lit("akmod-nvidia"),
        Lit("xorg-x11-drv-nvidia-cuda"),
    ]),
    proprietary_auto: VerbTemplate::new(&[
        Lit("dnf"),
        Lit("install"),
        Lit("-y"),
        Lit("akmod-nvidia"),
        Lit("xorg-x11-drv-nvidia-cuda"),
    ]),
    open_kernel: VerbTemplate::new(&[
        Lit("dnf"),
        Lit("install"),
        Lit("-y"),
        Lit("akmod-nvidia-open"),
    ]),
    amd_mesa: VerbTemplate::new(&[
        Lit("dnf"),
        Lit("install"),
        Lit("-y"),
        Lit("xorg-x11-drv-amdgpu"),
        Lit("mesa-dri-drivers"),
        Lit("mesa-vulkan-drivers"),
    ]),
    purge_nvidia: VerbTemplate::new(&[Lit("dnf"), Lit("remove"), Lit("-y"), Lit("*nvidia*")]),
    purge_extra: None,
    autoremove: Some(VerbTemplate::new(&[Lit("dnf"), Lit("autoremove"), Lit("-y")])),
    restore_nouveau: VerbTemplate::new(&[
        Lit("dnf"),
        Lit("install"),
        Lit("-y"),
        Lit("xorg-x11-drv-nouveau"),
    ]),
    initramfs: VerbTemplate::new(&[Lit("dracut"), Lit("--force")]),
    enable_component: None,
    install: VerbTemplate::new(&[
        Lit("dnf"),
        Lit("install"),
        Lit("-y"),
        Param {
            prefix: "",
            suffix: "",
        },
    ]),
    env: &[],
};

static PACMAN: VerbSet = VerbSet {
    kind: PackageManagerKind::Pacman,
    refresh: VerbTemplate::new(&[Lit("pacman"), Lit("-Sy")]),
    refresh_before_install: false,
    build_deps: VerbTemplate::new(&[
        Lit("pacman"),
        Lit("-S"),
        Lit("--needed"),
        Lit("--noconfirm"),
        Lit("base-devel"),
        Lit("linux-headers"),
    ]),
    proprietary: VerbTemplate::new(&[
        Lit("pacman"),
        Lit("-S"),
        Lit("--needed"),
        Lit("--noconfirm"),
        Lit("nvidia"),
        Lit("nvidia-utils"),
        Lit("nvidia-settings"),
    ]),
    proprietary_auto: VerbTemplate::new(&[
        Lit("pacman"),
        Lit("-S"),
        Lit("--needed"),
        Lit("--noconfirm"),
        Lit("nvidia"),
        Lit("nvidia-utils"),
        Lit("nvidia-settings"),
    ]),
    open_kernel: VerbTemplate::new(&[
        Lit("pacman"),
        Lit("-S"),
        Lit("--needed"),
        Lit("--noconfirm"),
        Lit("nvidia-open"),
        Lit("nvidia-utils"),
    ]),
    amd_mesa: VerbTemplate::new(&[
        Lit("pacman"),
        Lit("-S"),
        Lit("--needed"),
        Lit("--noconfirm"),
        Lit("xf86-video-amdgpu"),
        Lit("mesa"),
        Lit("vulkan-radeon"),
    ]),
    // -Rns refuses targets that are not installed
    purge_nvidia: VerbTemplate::tolerant(&[
        Lit("pacman"),
        Lit("-Rns"),
        Lit("--noconfirm"),
        Lit("nvidia"),
        Lit("nvidia-open"),
        Lit("nvidia-utils"),
        Lit("nvidia-settings"),
    ]),
    purge_extra: None,
    autoremove: None,
    restore_nouveau: VerbTemplate::new(&[
        Lit("pacman"),
        Lit("-S"),
        Lit("--needed"),
        Lit("--noconfirm"),
        Lit("xf86-video-nouveau"),
    ]),
    initramfs: VerbTemplate::new(&[Lit("mkinitcpio"), Lit("-P")]),
    enable_component: None,
    install: VerbTemplate::new(&[
        Lit("pacman"),
        Lit("-S"),
        Lit("--needed"),
        Lit("--noconfirm"),
        Param {
            prefix: "",
            suffix: "",
        },
    ]),
    env: &[],
};

static ZYPPER: VerbSet = VerbSet {
    kind: PackageManagerKind::Zypper,
    refresh: VerbTemplate::new(&[Lit("zypper"), Lit("--non-interactive"), Lit("refresh")]),
    refresh_before_install: true,
    build_deps: VerbTemplate::new(&[
        Lit("zypper"),
        Lit("--non-interactive"),
        Lit("install"),
        Lit("kernel-devel"),
        Lit("gcc"),
        Lit("make"),
    ]),
    proprietary: VerbTemplate::new(&[
        Lit("zypper"),
        Lit("--non-interactive"),
        Lit("install"),
        Lit("nvidia-glG05"),
    ]),
    proprietary_auto: VerbTemplate::new(&[
        Lit("zypper"),
        Lit("--non-interactive"),
        Lit("install"),
        Lit("nvidia-glG05"),
    ]),
    open_kernel: VerbTemplate::new(&[
        Lit("zypper"),
        Lit("--non-interactive"),
        Lit("install"),
        Lit("nvidia-open-driver-G06-signed-kmp-default"),
    ]),
    amd_mesa: VerbTemplate::new(&[
        Lit("zypper"),
        Lit("--non-interactive"),
        Lit("install"),
        Lit("Mesa"),
        Lit("Mesa-dri"),
        Lit("libvulkan_radeon"),
    ]),
    // exits 104 when no installed package matches
    purge_nvidia: VerbTemplate::tolerant(&[
        Lit("zypper"),
        Lit("--non-interactive"),
        Lit("remove"),
        Lit("--clean-deps"),
        Lit("*nvidia*"),
    ]),
    purge_extra: None,
    autoremove: None,
    restore_nouveau: VerbTemplate::new(&[
        Lit("zypper"),
        Lit("--non-interactive"),
        Lit("install"),
        Lit("xf86-video-nouveau"),
    ]),
    initramfs: VerbTemplate::new(&[Lit("mkinitrd")]),
    enable_component: None,
    install: VerbTemplate::new(&[
        Lit("zypper"),
        Lit("--non-interactive"),
        Lit("install"),
        Param {
            prefix: "",
            suffix: "",
        },
    ]),
    env: &[],
};

/// Verb table for `kind`; `None` when the platform is unsupported.
pub fn verbs(kind: PackageManagerKind) -> Option<&'static VerbSet> {
    match kind {
        PackageManagerKind::Apt => Some(&APT),
        PackageManagerKind::Dnf => Some(&DNF),
        PackageManagerKind::Pacman => Some(&PACMAN),
        PackageManagerKind::Zypper => Some(&ZYPPER),
        PackageManagerKind::None => None,
    }
}

/// Like `verbs`, but an unsupported platform is an error.
pub fn require_verbs(kind: PackageManagerKind) -> Result<&'static VerbSet> {
    verbs(kind).ok_or_else(|| {
        PilotError::unsupported("no supported package manager (apt, dnf, pacman, zypper) detected")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_distro_mapping() {
        for id in ["ubuntu", "debian", "linuxmint", "pop"] {
            assert_eq!(package_manager_for(id), PackageManagerKind::Apt);
        }
        for id in ["fedora", "rhel", "centos"] {
            assert_eq!(package_manager_for(id), PackageManagerKind::Dnf);
        }
        for id in ["arch", "manjaro", "endeavouros"] {
            assert_eq!(package_manager_for(id), PackageManagerKind::Pacman);
        }
        for id in ["opensuse", "sles"] {
            assert_eq!(package_manager_for(id), PackageManagerKind::Zypper);
        }
        assert_eq!(package_manager_for("gentoo"), PackageManagerKind::None);
        assert_eq!(package_manager_for(""), PackageManagerKind::None);
    }

    #[test]
    fn test_os_release_parse() {
        let os = OsRelease::parse(
            "PRETTY_NAME=\"Fedora Linux 39 (Workstation Edition)\"\nID=fedora\nVERSION_ID=39\n",
        );
        assert_eq!(os.id(), "fedora");
        assert_eq!(os.pretty_name(), Some("Fedora Linux 39 (Workstation Edition)"));
        assert_eq!(os.version_id(), Some("39"));
        assert_eq!(os.package_manager(), PackageManagerKind::Dnf);
    }

    #[test]
    fn test_os_release_missing_id_defaults_to_linux() {
        let os = OsRelease::parse("NAME=Something\n");
        assert_eq!(os.id(), "linux");
        assert_eq!(os.package_manager(), PackageManagerKind::None);
    }

    #[test]
    fn test_driver_version_validation() {
        assert_eq!(DriverVersion::parse("535").unwrap().as_str(), "535");
        assert_eq!(DriverVersion::parse(" 550.54 ").unwrap().as_str(), "550.54");
        for bad in ["", "abc", "535; rm -rf /", "$(id)", ".5", "535-open"] {
            assert!(
                matches!(DriverVersion::parse(bad), Err(PilotError::InvalidVersion(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_every_supported_kind_has_verbs() {
        for kind in PackageManagerKind::iter() {
            assert_eq!(verbs(kind).is_some(), !kind.is_unsupported());
        }
        assert!(matches!(
            require_verbs(PackageManagerKind::None),
            Err(PilotError::EnvironmentUnsupported(_))
        ));
    }

    #[test]
    fn test_initramfs_verbs() {
        let rendered = |k| require_verbs(k).unwrap().initramfs.step(StepTag::FinalizeBoot).render();
        assert_eq!(rendered(PackageManagerKind::Apt), "update-initramfs -u");
        assert_eq!(rendered(PackageManagerKind::Dnf), "dracut --force");
        assert_eq!(rendered(PackageManagerKind::Pacman), "mkinitcpio -P");
        assert_eq!(rendered(PackageManagerKind::Zypper), "mkinitrd");
    }

    #[test]
    fn test_apt_versioned_templates() {
        let apt = require_verbs(PackageManagerKind::Apt).unwrap();
        assert!(apt.proprietary.is_parameterized());
        assert_eq!(
            apt.proprietary.step_with(StepTag::DriverAction, "550").render(),
            "apt-get install -y nvidia-driver-550 nvidia-settings"
        );
        assert_eq!(
            apt.open_kernel.step_with(StepTag::DriverAction, "535").render(),
            "apt-get install -y nvidia-driver-535-open nvidia-settings"
        );
        assert_eq!(
            apt.build_deps.step(StepTag::PrepareDeps).render(),
            "apt-get install -y build-essential linux-headers-$(uname -r)"
        );
    }

    #[test]
    fn test_apt_purge_patterns_are_quoted() {
        let apt = require_verbs(PackageManagerKind::Apt).unwrap();
        assert_eq!(
            apt.purge_nvidia.step(StepTag::DriverAction).render(),
            "apt-get remove --purge -y '^nvidia-.*' '^libnvidia-.*' '^xserver-xorg-video-nvidia.*'"
        );
    }

    #[test]
    fn test_only_apt_purges_amdgpu_pro() {
        let apt = require_verbs(PackageManagerKind::Apt).unwrap();
        let step = apt.purge_extra.unwrap().step(StepTag::Cleanup);
        assert!(step.is_tolerant());
        assert_eq!(step.render(), "{ apt-get remove --purge -y '^amdgpu-pro.*' || true; }");

        for kind in [PackageManagerKind::Dnf, PackageManagerKind::Pacman, PackageManagerKind::Zypper] {
            assert!(require_verbs(kind).unwrap().purge_extra.is_none(), "{}", kind);
        }
    }

    #[test]
    fn test_pacman_purge_is_tolerant() {
        let pacman = require_verbs(PackageManagerKind::Pacman).unwrap();
        let step = pacman.purge_nvidia.step(StepTag::DriverAction);
        assert!(step.is_tolerant());
        assert!(step.render().starts_with("{ pacman -Rns"));
    }

    #[test]
    fn test_zypper_purge_is_tolerant() {
        let zypper = require_verbs(PackageManagerKind::Zypper).unwrap();
        let step = zypper.purge_nvidia.step(StepTag::DriverAction);
        assert!(step.is_tolerant());
        assert!(step.render().starts_with("{ zypper --non-interactive remove --clean-deps"));
    }

    #[test]
    fn test_unfilled_param_is_dropped() {
        let apt = require_verbs(PackageManagerKind::Apt).unwrap();
        assert_eq!(
            apt.install.step(StepTag::PrepareDeps).render(),
            "apt-get install -y"
        );
        assert_eq!(
            apt.install.step_with(StepTag::PrepareDeps, "gamemode").render(),
            "apt-get install -y gamemode"
        );
    }
}
