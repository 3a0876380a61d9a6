//! Per-protocol connection parameters.
//!
//! Each asset protocol has an options struct holding the settings guacd
//! understands for it. [`ConnectionParams::build`] turns an asset plus its
//! options into a [`TunnelConfiguration`].

use serde::{Deserialize, Serialize};

use super::tunnel::TunnelConfiguration;

/// Remote protocols reachable through guacd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetProtocol {
    Rdp,
    Ssh,
    Vnc,
    Telnet,
    Kubernetes,
}

impl AssetProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rdp => "rdp",
            Self::Ssh => "ssh",
            Self::Vnc => "vnc",
            Self::Telnet => "telnet",
            Self::Kubernetes => "kubernetes",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Self::Rdp => 3389,
            Self::Ssh => 22,
            Self::Vnc => 5900,
            Self::Telnet => 23,
            Self::Kubernetes => 443,
        }
    }
}

impl std::fmt::Display for AssetProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RdpOptions {
    /// `any`, `nla`, `nla-ext`, `tls`, `vmconnect` or `rdp`.
    pub security: Option<String>,
    pub ignore_cert: bool,
    pub domain: Option<String>,
    pub color_depth: Option<u8>,
    pub console: bool,
    pub enable_drive: bool,
    pub drive_name: Option<String>,
    pub drive_path: Option<String>,
    pub enable_wallpaper: bool,
    pub enable_theming: bool,
    pub enable_font_smoothing: bool,
    pub remote_app: Option<String>,
    pub remote_app_dir: Option<String>,
    pub remote_app_args: Option<String>,
    pub preconnection_id: Option<u32>,
    pub preconnection_blob: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshOptions {
    pub font_name: Option<String>,
    pub font_size: Option<u16>,
    pub color_scheme: Option<String>,
    /// Key code sent for backspace (127 or 8).
    pub backspace: Option<u8>,
    pub terminal_type: Option<String>,
    pub enable_sftp: bool,
    pub sftp_root_directory: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VncOptions {
    pub color_depth: Option<u8>,
    /// `local` or `remote`.
    pub cursor: Option<String>,
    pub swap_red_blue: bool,
    pub dest_host: Option<String>,
    pub dest_port: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelnetOptions {
    pub font_name: Option<String>,
    pub font_size: Option<u16>,
    pub color_scheme: Option<String>,
    pub backspace: Option<u8>,
    pub terminal_type: Option<String>,
    pub username_regex: Option<String>,
    pub password_regex: Option<String>,
    pub login_success_regex: Option<String>,
    pub login_failure_regex: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KubernetesOptions {
    pub namespace: Option<String>,
    pub pod: Option<String>,
    pub container: Option<String>,
    pub exec_command: Option<String>,
    pub use_ssl: bool,
    pub ignore_cert: bool,
    pub ca_cert: Option<String>,
    pub client_cert: Option<String>,
    pub client_key: Option<String>,
}

/// Protocol-specific options, tagged by protocol name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "lowercase")]
pub enum ProtocolOptions {
    Rdp(RdpOptions),
    Ssh(SshOptions),
    Vnc(VncOptions),
    Telnet(TelnetOptions),
    Kubernetes(KubernetesOptions),
}

impl ProtocolOptions {
    pub fn protocol(&self) -> AssetProtocol {
        match self {
            Self::Rdp(_) => AssetProtocol::Rdp,
            Self::Ssh(_) => AssetProtocol::Ssh,
            Self::Vnc(_) => AssetProtocol::Vnc,
            Self::Telnet(_) => AssetProtocol::Telnet,
            Self::Kubernetes(_) => AssetProtocol::Kubernetes,
        }
    }

    /// Write this protocol's parameters into `config`.
    pub fn apply(&self, config: &mut TunnelConfiguration) {
        match self {
            Self::Rdp(o) => apply_rdp(o, config),
            Self::Ssh(o) => apply_ssh(o, config),
            Self::Vnc(o) => apply_vnc(o, config),
            Self::Telnet(o) => apply_telnet(o, config),
            Self::Kubernetes(o) => apply_kubernetes(o, config),
        }
    }
}

/// Everything needed to build a new connection's parameters.
#[derive(Debug, Clone, Default)]
pub struct ConnectionParams<'a> {
    pub hostname: &'a str,
    pub port: u16,
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
    pub private_key: Option<&'a str>,
    pub passphrase: Option<&'a str>,
    pub width: u32,
    pub height: u32,
    pub dpi: u32,
    pub timezone: &'a str,
    /// `(directory, file name)` when the session is recorded.
    pub recording: Option<(&'a str, &'a str)>,
}

impl ConnectionParams<'_> {
    pub fn build(&self, options: &ProtocolOptions) -> TunnelConfiguration {
        let mut config = TunnelConfiguration::new(options.protocol().as_str());
        config.timezone = self.timezone.to_string();

        config.set("hostname", self.hostname);
        config.set("port", self.port.to_string());
        config.set("width", self.width.to_string());
        config.set("height", self.height.to_string());
        config.set("dpi", self.dpi.to_string());
        set_opt(&mut config, "username", self.username);
        set_opt(&mut config, "password", self.password);

        if let Some((path, name)) = self.recording {
            config.set("recording-path", path);
            config.set("recording-name", name);
            config.set("create-recording-path", "true");
        }

        options.apply(&mut config);

        // Key material only means something to the SSH plugin.
        if matches!(options, ProtocolOptions::Ssh(_)) {
            set_opt(&mut config, "private-key", self.private_key);
            set_opt(&mut config, "passphrase", self.passphrase);
        }
        config
    }
}

/// Parameters for an observer joining `connection_id`.
pub fn observer_join(connection_id: &str, width: u32, height: u32, dpi: u32) -> TunnelConfiguration {
    let mut config = TunnelConfiguration::join(connection_id);
    config.set("read-only", "true");
    config.set("width", width.to_string());
    config.set("height", height.to_string());
    config.set("dpi", dpi.to_string());
    config
}

fn set_opt<T: ToString>(config: &mut TunnelConfiguration, name: &str, value: Option<T>) {
    if let Some(v) = value {
        config.set(name, v.to_string());
    }
}

fn set_flag(config: &mut TunnelConfiguration, name: &str, on: bool) {
    if on {
        config.set(name, "true");
    }
}

fn apply_rdp(o: &RdpOptions, config: &mut TunnelConfiguration) {
    config.set("security", o.security.as_deref().unwrap_or("any"));
    config.set("resize-method", "display-update");
    set_flag(config, "ignore-cert", o.ignore_cert);
    set_opt(config, "domain", o.domain.as_deref());
    set_opt(config, "color-depth", o.color_depth);
    set_flag(config, "console", o.console);

    if o.enable_drive {
        config.set("enable-drive", "true");
        config.set("drive-name", o.drive_name.as_deref().unwrap_or("Shared"));
        set_opt(config, "drive-path", o.drive_path.as_deref());
        config.set("create-drive-path", "true");
    }

    set_flag(config, "enable-wallpaper", o.enable_wallpaper);
    set_flag(config, "enable-theming", o.enable_theming);
    set_flag(config, "enable-font-smoothing", o.enable_font_smoothing);

    if let Some(app) = o.remote_app.as_deref() {
        config.set("remote-app", app);
        set_opt(config, "remote-app-dir", o.remote_app_dir.as_deref());
        set_opt(config, "remote-app-args", o.remote_app_args.as_deref());
    }

    set_opt(config, "preconnection-id", o.preconnection_id);
    set_opt(config, "preconnection-blob", o.preconnection_blob.as_deref());
}

fn apply_ssh(o: &SshOptions, config: &mut TunnelConfiguration) {
    set_opt(config, "font-name", o.font_name.as_deref());
    set_opt(config, "font-size", o.font_size);
    set_opt(config, "color-scheme", o.color_scheme.as_deref());
    set_opt(config, "backspace", o.backspace);
    set_opt(config, "terminal-type", o.terminal_type.as_deref());
    if o.enable_sftp {
        config.set("enable-sftp", "true");
        set_opt(config, "sftp-root-directory", o.sftp_root_directory.as_deref());
    }
}

fn apply_vnc(o: &VncOptions, config: &mut TunnelConfiguration) {
    set_opt(config, "color-depth", o.color_depth);
    set_opt(config, "cursor", o.cursor.as_deref());
    set_flag(config, "swap-red-blue", o.swap_red_blue);
    set_opt(config, "dest-host", o.dest_host.as_deref());
    set_opt(config, "dest-port", o.dest_port);
}

fn apply_telnet(o: &TelnetOptions, config: &mut TunnelConfiguration) {
    set_opt(config, "font-name", o.font_name.as_deref());
    set_opt(config, "font-size", o.font_size);
    set_opt(config, "color-scheme", o.color_scheme.as_deref());
    set_opt(config, "backspace", o.backspace);
    set_opt(config, "terminal-type", o.terminal_type.as_deref());
    set_opt(config, "username-regex", o.username_regex.as_deref());
    set_opt(config, "password-regex", o.password_regex.as_deref());
    set_opt(config, "login-success-regex", o.login_success_regex.as_deref());
    set_opt(config, "login-failure-regex", o.login_failure_regex.as_deref());
}

fn apply_kubernetes(o: &KubernetesOptions, config: &mut TunnelConfiguration) {
    config.set("namespace", o.namespace.as_deref().unwrap_or("default"));
    set_opt(config, "pod", o.pod.as_deref());
    set_opt(config, "container", o.container.as_deref());
    set_opt(config, "exec-command", o.exec_command.as_deref());
    set_flag(config, "use-ssl", o.use_ssl);
    set_flag(config, "ignore-cert", o.ignore_cert);
    set_opt(config, "ca-cert", o.ca_cert.as_deref());
    set_opt(config, "client-cert", o.client_cert.as_deref());
    set_opt(config, "client-key", o.client_key.as_deref());
}
