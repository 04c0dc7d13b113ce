use crate::engine::EngineConfig;
use structopt::clap::AppSettings;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(global_settings = &[AppSettings::ColoredHelp],
            after_help = r#"Press enter (or type `logout`) to drop the game connection,
`status` lists the tracked connections, `restart` reinitializes, ^D exits."#)]
/// instant logout by resetting the game's tcp connection
pub struct Args {
    /// Hotkey name reported to the front-end
    #[structopt(long = "hotkey", default_value = "f9")]
    pub hotkey: String,
    /// Remote port of the game server
    #[structopt(short = "p", long = "port", default_value = "6112")]
    pub port: u16,
    /// Number of injection workers
    #[structopt(short = "t", long = "threads", default_value = "4")]
    pub threads: usize,
    /// Substring of the game's process name
    #[structopt(long = "process", default_value = "PathOfExile")]
    pub process: String,
    /// The interface to capture and inject on
    #[structopt(short = "i", long = "interface")]
    pub interface: Option<String>,
    /// Never inject over the link layer
    #[structopt(long = "no-layer2")]
    pub no_layer2: bool,
    /// Disable verbose output
    #[structopt(short = "q", long = "quiet", parse(from_occurrences))]
    pub quiet: u8,
}

impl Args {
    pub fn into_config(self) -> EngineConfig {
        EngineConfig {
            hotkey: self.hotkey,
            game_port: self.port,
            worker_threads: self.threads.max(1),
            process_name: self.process,
            interface: self.interface,
            allow_link_layer: !self.no_layer2,
            ..EngineConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_engine() {
        let config = Args::from_iter(&["rsdisconnect"]).into_config();
        let defaults = EngineConfig::default();
        assert_eq!(config.hotkey, defaults.hotkey);
        assert_eq!(config.game_port, 6112);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.process_name, "PathOfExile");
        assert!(config.interface.is_none());
        assert!(config.allow_link_layer);
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::from_iter(&[
            "rsdisconnect", "-p", "443", "-t", "0", "-i", "eth1", "--no-layer2", "--process", "Game", "-qq",
        ]);
        assert_eq!(args.quiet, 2);
        let config = args.into_config();
        assert_eq!(config.game_port, 443);
        assert_eq!(config.worker_threads, 1);
        assert_eq!(config.interface.as_deref(), Some("eth1"));
        assert_eq!(config.process_name, "Game");
        assert!(!config.allow_link_layer);
    }
}
