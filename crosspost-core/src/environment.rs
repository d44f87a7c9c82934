use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use sysinfo::Components;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::AutomationSection;

pub type EnvironmentResult<T> = Result<T, EnvironmentError>;

#[derive(Debug, Error)]
pub enum EnvironmentError {
    #[error("unable to identify host operating system `{0}`")]
    DetectionFailure(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OsKind {
    Linux,
    MacOs,
    Windows,
    FreeBsd,
}

impl OsKind {
    fn from_target(value: &str) -> Option<Self> {
        match value {
            "linux" => Some(OsKind::Linux),
            "macos" => Some(OsKind::MacOs),
            "windows" => Some(OsKind::Windows),
            "freebsd" => Some(OsKind::FreeBsd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CpuArch {
    X86_64,
    Aarch64,
    X86,
    Arm,
    Other(String),
}

impl CpuArch {
    fn from_target(value: &str) -> Self {
        match value {
            "x86_64" => CpuArch::X86_64,
            "aarch64" => CpuArch::Aarch64,
            "x86" => CpuArch::X86,
            "arm" => CpuArch::Arm,
            other => CpuArch::Other(other.to_string()),
        }
    }
}

impl fmt::Display for CpuArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CpuArch::X86_64 => f.write_str("x86_64"),
            CpuArch::Aarch64 => f.write_str("aarch64"),
            CpuArch::X86 => f.write_str("x86"),
            CpuArch::Arm => f.write_str("arm"),
            CpuArch::Other(value) => f.write_str(value),
        }
    }
}

/// One observed hint that the host is a VM or container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualizationSignal {
    pub name: String,
    pub weight: u8,
}

const STRONG: u8 = 2;
const WEAK: u8 = 1;
const VIRTUALIZED_THRESHOLD: u8 = 2;

const HYPERVISOR_VENDORS: &[&str] = &[
    "qemu",
    "kvm",
    "vmware",
    "virtualbox",
    "innotek",
    "xen",
    "amazon ec2",
    "google compute engine",
    "microsoft corporation",
    "digitalocean",
    "hetzner",
    "openstack",
    "bochs",
    "parallels",
];

const CGROUP_MARKERS: &[&str] = &["docker", "kubepods", "lxc", "containerd", "libpod"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EnvironmentProfile {
    pub os_kind: OsKind,
    pub cpu_arch: CpuArch,
    pub is_virtualized: bool,
    pub is_headless: bool,
    pub display_available: bool,
    pub signals: Vec<VirtualizationSignal>,
}

impl EnvironmentProfile {
    pub fn prefers_headless(&self) -> bool {
        self.is_virtualized || self.is_headless
    }
}

/// Host facts the probe reads. Split out so detection can run against a
/// scripted host in tests.
pub trait HostFacts: Send + Sync {
    fn os(&self) -> String;
    fn arch(&self) -> String;
    fn env_var(&self, key: &str) -> Option<String>;
    fn path_exists(&self, path: &Path) -> bool;
    fn read_to_string(&self, path: &Path) -> Option<String>;
    /// Number of hardware temperature sensors, `None` when the platform cannot tell.
    fn sensor_count(&self) -> Option<usize>;
}

#[derive(Debug, Default)]
pub struct SystemHost;

impl HostFacts for SystemHost {
    fn os(&self) -> String {
        std::env::consts::OS.to_string()
    }

    fn arch(&self) -> String {
        std::env::consts::ARCH.to_string()
    }

    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok().filter(|value| !value.is_empty())
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn read_to_string(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path).ok()
    }

    fn sensor_count(&self) -> Option<usize> {
        if cfg!(target_os = "linux") {
            Some(Components::new_with_refreshed_list().list().len())
        } else {
            None
        }
    }
}

#[derive(Clone)]
pub struct EnvironmentProbe {
    host: Arc<dyn HostFacts>,
}

impl Default for EnvironmentProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EnvironmentProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvironmentProbe").finish()
    }
}

impl EnvironmentProbe {
    pub fn new() -> Self {
        Self {
            host: Arc::new(SystemHost),
        }
    }

    pub fn with_host(host: Arc<dyn HostFacts>) -> Self {
        Self { host }
    }

    pub fn profile(&self) -> EnvironmentResult<EnvironmentProfile> {
        let os = self.host.os();
        let os_kind = OsKind::from_target(&os).ok_or(EnvironmentError::DetectionFailure(os))?;
        let cpu_arch = CpuArch::from_target(&self.host.arch());

        let signals = if matches!(os_kind, OsKind::Linux | OsKind::FreeBsd) {
            self.virtualization_signals()
        } else {
            Vec::new()
        };
        let score: u8 = signals.iter().map(|signal| signal.weight).sum();
        let is_virtualized = score >= VIRTUALIZED_THRESHOLD;

        let display_available = match os_kind {
            OsKind::MacOs | OsKind::Windows => true,
            OsKind::Linux | OsKind::FreeBsd => {
                self.host.env_var("DISPLAY").is_some()
                    || self.host.env_var("WAYLAND_DISPLAY").is_some()
            }
        };

        let profile = EnvironmentProfile {
            os_kind,
            cpu_arch,
            is_virtualized,
            is_headless: !display_available,
            display_available,
            signals,
        };
        info!(
            os = ?profile.os_kind,
            arch = %profile.cpu_arch,
            virtualized = profile.is_virtualized,
            headless = profile.is_headless,
            "environment profiled"
        );
        Ok(profile)
    }

    fn virtualization_signals(&self) -> Vec<VirtualizationSignal> {
        let mut signals = Vec::new();
        let mut push = |name: &str, weight: u8| {
            debug!(signal = name, weight, "virtualization signal");
            signals.push(VirtualizationSignal {
                name: name.to_string(),
                weight,
            });
        };

        if let Some(cpuinfo) = self.host.read_to_string(Path::new("/proc/cpuinfo")) {
            let flagged = cpuinfo
                .lines()
                .filter(|line| line.starts_with("flags"))
                .any(|line| line.split_whitespace().any(|flag| flag == "hypervisor"));
            if flagged {
                push("cpu hypervisor flag", STRONG);
            }
        }
        for marker in ["/proc/vz", "/proc/xen", "/sys/hypervisor/type"] {
            if self.host.path_exists(Path::new(marker)) {
                push(marker, STRONG);
            }
        }
        for marker in ["/.dockerenv", "/run/.containerenv"] {
            if self.host.path_exists(Path::new(marker)) {
                push(marker, STRONG);
            }
        }
        if let Some(cgroup) = self.host.read_to_string(Path::new("/proc/1/cgroup")) {
            if let Some(marker) = CGROUP_MARKERS.iter().find(|m| cgroup.contains(*m)) {
                push(&format!("cgroup {marker}"), STRONG);
            }
        }
        let vendor = ["/sys/class/dmi/id/sys_vendor", "/sys/class/dmi/id/product_name"]
            .iter()
            .filter_map(|path| self.host.read_to_string(Path::new(path)))
            .map(|value| value.trim().to_ascii_lowercase())
            .find(|value| HYPERVISOR_VENDORS.iter().any(|known| value.contains(known)));
        if let Some(vendor) = vendor {
            push(&format!("dmi vendor {vendor}"), WEAK);
        }
        if self.host.sensor_count() == Some(0) {
            push("no hardware sensors", WEAK);
        }
        signals
    }
}

/// Effective browser launch mode after host policy and config overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AutomationMode {
    pub headless: bool,
    pub single_process: bool,
    pub no_sandbox: bool,
    pub disable_gpu: bool,
}

impl AutomationMode {
    pub fn resolve(profile: &EnvironmentProfile, overrides: &AutomationSection) -> Self {
        let conservative = profile.prefers_headless();
        Self {
            headless: overrides.headless.unwrap_or(conservative),
            single_process: overrides.single_process.unwrap_or(conservative),
            no_sandbox: overrides.no_sandbox.unwrap_or(conservative),
            disable_gpu: overrides.disable_gpu.unwrap_or(conservative),
        }
    }

    pub fn chromium_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.single_process {
            args.push("--single-process".to_string());
        }
        if self.disable_gpu {
            args.push("--disable-gpu".to_string());
        }
        if self.headless {
            args.push("--disable-dev-shm-usage".to_string());
        }
        args
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;

    #[derive(Default)]
    pub(crate) struct FakeHost {
        pub os: String,
        pub arch: String,
        pub env: HashMap<String, String>,
        pub paths: HashSet<PathBuf>,
        pub files: HashMap<PathBuf, String>,
        pub sensors: Option<usize>,
    }

    impl FakeHost {
        pub(crate) fn linux() -> Self {
            Self {
                os: "linux".into(),
                arch: "x86_64".into(),
                sensors: Some(4),
                ..Default::default()
            }
        }
    }

    impl HostFacts for FakeHost {
        fn os(&self) -> String {
            self.os.clone()
        }
        fn arch(&self) -> String {
            self.arch.clone()
        }
        fn env_var(&self, key: &str) -> Option<String> {
            self.env.get(key).cloned()
        }
        fn path_exists(&self, path: &Path) -> bool {
            self.paths.contains(path) || self.files.contains_key(path)
        }
        fn read_to_string(&self, path: &Path) -> Option<String> {
            self.files.get(path).cloned()
        }
        fn sensor_count(&self) -> Option<usize> {
            self.sensors
        }
    }

    fn probe(host: FakeHost) -> EnvironmentProfile {
        EnvironmentProbe::with_host(Arc::new(host)).profile().unwrap()
    }

    #[test]
    fn desktop_linux_with_display_is_visible() {
        let mut host = FakeHost::linux();
        host.env.insert("DISPLAY".into(), ":0".into());
        let profile = probe(host);
        assert!(!profile.is_virtualized);
        assert!(!profile.is_headless);
        let mode = AutomationMode::resolve(&profile, &AutomationSection::default());
        assert!(!mode.headless);
        assert!(mode.chromium_args().is_empty());
    }

    #[test]
    fn single_weak_signal_is_not_enough() {
        let mut host = FakeHost::linux();
        host.env.insert("WAYLAND_DISPLAY".into(), "wayland-0".into());
        host.sensors = Some(0);
        let profile = probe(host);
        assert_eq!(profile.signals.len(), 1);
        assert!(!profile.is_virtualized);
    }

    #[test]
    fn container_vps_gets_conservative_headless_mode() {
        let mut host = FakeHost::linux();
        host.files.insert(
            PathBuf::from("/proc/1/cgroup"),
            "0::/system.slice/docker-abc.scope\n".into(),
        );
        host.files.insert(
            PathBuf::from("/sys/class/dmi/id/sys_vendor"),
            "QEMU\n".into(),
        );
        let profile = probe(host);
        assert!(profile.is_virtualized);
        assert!(profile.is_headless);
        let mode = AutomationMode::resolve(&profile, &AutomationSection::default());
        assert!(mode.headless && mode.single_process && mode.no_sandbox && mode.disable_gpu);
        assert!(mode
            .chromium_args()
            .contains(&"--single-process".to_string()));
    }

    #[test]
    fn explicit_config_overrides_host_policy() {
        let mut host = FakeHost::linux();
        host.paths.insert(PathBuf::from("/proc/xen"));
        let profile = probe(host);
        let overrides = AutomationSection {
            headless: Some(false),
            single_process: Some(false),
            ..AutomationSection::default()
        };
        let mode = AutomationMode::resolve(&profile, &overrides);
        assert!(!mode.headless);
        assert!(!mode.single_process);
        assert!(mode.no_sandbox);
    }

    #[test]
    fn macos_always_has_a_display() {
        let host = FakeHost {
            os: "macos".into(),
            arch: "aarch64".into(),
            ..Default::default()
        };
        let profile = probe(host);
        assert!(profile.display_available);
        assert_eq!(profile.cpu_arch, CpuArch::Aarch64);
    }

    #[test]
    fn unknown_os_is_fatal() {
        let host = FakeHost {
            os: "plan9".into(),
            ..Default::default()
        };
        let result = EnvironmentProbe::with_host(Arc::new(host)).profile();
        assert!(matches!(result, Err(EnvironmentError::DetectionFailure(os)) if os == "plan9"));
    }
}
