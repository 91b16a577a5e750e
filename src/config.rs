use serde::Deserialize;

pub const ENV_PREFIX: &str = "FWFLEET";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub ssh: SshConfig,
    pub rollout: RolloutConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Timeouts for the remote-shell transport and per-command classes.
///
/// The defaults encode the fleet contract: a 30 s TCP/handshake window,
/// 60 s for ordinary commands, a short 10 s reachability probe, five
/// minutes for the firmware download, and 120 s for the flash submission
/// (which normally ends with the device severing the session).
#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub ping_timeout_secs: u64,
    pub download_timeout_secs: u64,
    pub apply_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RolloutConfig {
    /// How many times the engine re-probes a rebooting device.
    pub reboot_poll_attempts: u32,
    /// Delay before each reboot re-probe.
    pub reboot_poll_interval_secs: u64,
    /// Length of one countdown tick of the inter-batch pause. One minute in
    /// production; tests shrink it so countdown behavior stays observable.
    pub pause_tick_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            command_timeout_secs: 60,
            ping_timeout_secs: 10,
            download_timeout_secs: 300,
            apply_timeout_secs: 120,
        }
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            reboot_poll_attempts: 20,
            reboot_poll_interval_secs: 30,
            pause_tick_secs: 60,
        }
    }
}

impl SshConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_timeout_secs == 0 {
            anyhow::bail!("ssh.connect_timeout_secs must be > 0");
        }
        if self.command_timeout_secs == 0 {
            anyhow::bail!("ssh.command_timeout_secs must be > 0");
        }
        if self.ping_timeout_secs == 0 {
            anyhow::bail!("ssh.ping_timeout_secs must be > 0");
        }
        if self.download_timeout_secs == 0 {
            anyhow::bail!("ssh.download_timeout_secs must be > 0");
        }
        if self.apply_timeout_secs == 0 {
            anyhow::bail!("ssh.apply_timeout_secs must be > 0");
        }
        Ok(())
    }
}

impl RolloutConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reboot_poll_attempts == 0 {
            anyhow::bail!("rollout.reboot_poll_attempts must be > 0");
        }
        Ok(())
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .try_parsing(false);

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("database.url", "sqlite://data/fwfleet.db")?
        .set_default("ssh.connect_timeout_secs", 30u64)?
        .set_default("ssh.command_timeout_secs", 60u64)?
        .set_default("ssh.ping_timeout_secs", 10u64)?
        .set_default("ssh.download_timeout_secs", 300u64)?
        .set_default("ssh.apply_timeout_secs", 120u64)?
        .set_default("rollout.reboot_poll_attempts", 20u32)?
        .set_default("rollout.reboot_poll_interval_secs", 30u64)?
        .set_default("rollout.pause_tick_secs", 60u64)?;

    let cfg = builder.build()?;
    let app: AppConfig = cfg.try_deserialize()?;
    app.ssh.validate()?;
    app.rollout.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, panic, sync::Mutex};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_fwfleet_env(vars: &[(&str, &str)], test: impl FnOnce() + panic::UnwindSafe) {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        let prefix = format!("{}__", ENV_PREFIX);

        let existing: Vec<(String, String)> = env::vars()
            .filter(|(key, _)| key.starts_with(&prefix))
            .collect();

        for (key, _) in &existing {
            env::remove_var(key);
        }

        for (key, value) in vars {
            env::set_var(key, value);
        }

        let result = panic::catch_unwind(test);

        for (key, _) in vars {
            env::remove_var(key);
        }

        for (key, value) in existing {
            env::set_var(key, value);
        }

        result.unwrap();
    }

    #[test]
    fn defaults_match_fleet_timeouts() {
        with_fwfleet_env(&[], || {
            let cfg = load().expect("config loads");
            assert_eq!(cfg.ssh.connect_timeout_secs, 30);
            assert_eq!(cfg.ssh.command_timeout_secs, 60);
            assert_eq!(cfg.ssh.ping_timeout_secs, 10);
            assert_eq!(cfg.ssh.download_timeout_secs, 300);
            assert_eq!(cfg.ssh.apply_timeout_secs, 120);
            assert_eq!(cfg.rollout.reboot_poll_attempts, 20);
            assert_eq!(cfg.rollout.reboot_poll_interval_secs, 30);
            assert_eq!(cfg.rollout.pause_tick_secs, 60);
            assert_eq!(cfg.database.url, "sqlite://data/fwfleet.db");
        });
    }

    #[test]
    fn env_overrides_parse_numeric_values() {
        with_fwfleet_env(
            &[
                ("FWFLEET__SERVER__PORT", "9090"),
                ("FWFLEET__ROLLOUT__REBOOT_POLL_ATTEMPTS", "5"),
                ("FWFLEET__SSH__COMMAND_TIMEOUT_SECS", "15"),
            ],
            || {
                let cfg = load().expect("config loads");
                assert_eq!(cfg.server.port, 9090);
                assert_eq!(cfg.rollout.reboot_poll_attempts, 5);
                assert_eq!(cfg.ssh.command_timeout_secs, 15);
            },
        );
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        with_fwfleet_env(&[("FWFLEET__SSH__CONNECT_TIMEOUT_SECS", "0")], || {
            let err = load().expect_err("should fail");
            assert!(err.to_string().contains("connect_timeout_secs"));
        });
    }
}
