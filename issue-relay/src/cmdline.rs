use std::path::PathBuf;
use std::time::Duration;

use clap::{Arg, ArgAction, ArgMatches, Command};
use issue_relay_core::Mode;
use issue_relay_core::config::{Settings, parse_brokers};

pub(super) fn root_cli() -> Command {
    Command::new("issue-relay")
        .about("Polls GitHub issues into Kafka and publishes their summaries")
        .long_about(
            "Every option can also be set through its RELAY_* environment variable, flags win. \
             Credentials are only read from GITHUB_TOKEN and OPENAI_API_KEY.",
        )
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(poll_subcmd())
        .subcommand(transform_subcmd())
        .subcommand(run_subcmd())
}

fn poll_subcmd() -> Command {
    Command::new("poll")
        .about("Publish tracker items updated since the watermark to the source topic")
        .args(broker_args())
        .args(poller_args())
}

fn transform_subcmd() -> Command {
    Command::new("transform")
        .about("Summarize source topic records into the derived topic")
        .args(broker_args())
        .args(transformer_args())
}

fn run_subcmd() -> Command {
    Command::new("run")
        .about("Run the poller and the transformer side by side")
        .args(broker_args())
        .args(poller_args())
        .args(transformer_args())
}

fn broker_args() -> Vec<Arg> {
    vec![
        Arg::new("broker")
            .long("broker")
            .help("Comma separated bootstrap servers")
            .action(ArgAction::Set),
        Arg::new("source-topic")
            .long("source-topic")
            .help("Topic the raw items are published to")
            .action(ArgAction::Set),
        Arg::new("metrics-port")
            .long("metrics-port")
            .help("Port of the /metrics and /livez server, 0 disables it")
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(u16)),
    ]
}

fn poller_args() -> Vec<Arg> {
    vec![
        Arg::new("owner")
            .long("owner")
            .help("Repository owner")
            .action(ArgAction::Set),
        Arg::new("repo")
            .long("repo")
            .help("Repository name")
            .action(ArgAction::Set),
        Arg::new("poll-period-secs")
            .long("poll-period-secs")
            .help("Seconds between two fetch cycles")
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(u64).range(1..)),
        Arg::new("watermark-path")
            .long("watermark-path")
            .help("File keeping the watermark across restarts")
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(PathBuf)),
    ]
}

fn transformer_args() -> Vec<Arg> {
    vec![
        Arg::new("derived-topic")
            .long("derived-topic")
            .help("Topic the summaries are published to")
            .action(ArgAction::Set),
        Arg::new("dead-letter-topic")
            .long("dead-letter-topic")
            .help("Topic for records that keep failing")
            .action(ArgAction::Set),
        Arg::new("group-id")
            .long("group-id")
            .help("Consumer group of the source topic")
            .action(ArgAction::Set),
        Arg::new("max-attempts")
            .long("max-attempts")
            .help("Failed attempts before a record is dead-lettered, 0 never gives up")
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(u32)),
    ]
}

pub(super) fn mode(name: &str) -> Option<Mode> {
    match name {
        "poll" => Some(Mode::Poll),
        "transform" => Some(Mode::Transform),
        "run" => Some(Mode::Both),
        _ => None,
    }
}

/// Applies the flags present in `matches` on top of the environment settings.
pub(super) fn apply_overrides(
    matches: &ArgMatches,
    settings: &mut Settings,
) -> issue_relay_core::Result<()> {
    // an arg that is not defined on this subcommand reads as absent
    let string = |id: &str| -> Option<String> {
        matches
            .try_get_one::<String>(id)
            .ok()
            .flatten()
            .cloned()
    };

    if let Some(broker) = string("broker") {
        settings.broker.brokers = parse_brokers(&broker)?;
    }
    if let Some(topic) = string("source-topic") {
        settings.broker.source_topic = topic;
    }
    if let Ok(Some(port)) = matches.try_get_one::<u16>("metrics-port") {
        settings.metrics_port = *port;
    }
    if let Some(owner) = string("owner") {
        settings.tracker.owner = owner;
    }
    if let Some(repo) = string("repo") {
        settings.tracker.repo = repo;
    }
    if let Ok(Some(secs)) = matches.try_get_one::<u64>("poll-period-secs") {
        settings.scheduler.poll_period = Duration::from_secs(*secs);
    }
    if let Ok(Some(path)) = matches.try_get_one::<PathBuf>("watermark-path") {
        settings.scheduler.watermark_path = Some(path.clone());
    }
    if let Some(topic) = string("derived-topic") {
        settings.broker.derived_topic = topic;
    }
    if let Some(topic) = string("dead-letter-topic") {
        settings.broker.dead_letter_topic = Some(topic);
    }
    if let Some(group) = string("group-id") {
        settings.broker.group_id = group;
    }
    if let Ok(Some(attempts)) = matches.try_get_one::<u32>("max-attempts") {
        settings.pipeline.max_attempts = *attempts;
    }

    settings.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        root_cli().debug_assert();
    }

    #[test]
    fn test_overrides_win_over_environment() {
        let matches = root_cli()
            .try_get_matches_from([
                "issue-relay",
                "run",
                "--broker",
                "kafka-0:9092,kafka-1:9092",
                "--dead-letter-topic",
                "issues-dlq",
                "--poll-period-secs",
                "600",
                "--metrics-port",
                "0",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(mode(name), Some(Mode::Both));

        let mut settings = Settings::load([("RELAY_BROKER_ADDRESS", "env:9092")]).unwrap();
        apply_overrides(sub, &mut settings).unwrap();
        assert_eq!(settings.broker.brokers, vec!["kafka-0:9092", "kafka-1:9092"]);
        assert_eq!(settings.broker.dead_letter_topic.as_deref(), Some("issues-dlq"));
        assert_eq!(settings.scheduler.poll_period, Duration::from_secs(600));
        assert_eq!(settings.metrics_port, 0);
        // untouched values keep their defaults
        assert_eq!(settings.broker.source_topic, "github-issues");
    }

    #[test]
    fn test_poll_has_no_transformer_flags() {
        let result = root_cli().try_get_matches_from(["issue-relay", "poll", "--group-id", "g"]);
        assert!(result.is_err());

        let matches = root_cli()
            .try_get_matches_from(["issue-relay", "poll", "--owner", "rust-lang"])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(mode(name), Some(Mode::Poll));
        let mut settings = Settings::default();
        apply_overrides(sub, &mut settings).unwrap();
        assert_eq!(settings.tracker.owner, "rust-lang");
    }

    #[test]
    fn test_invalid_override_is_rejected() {
        let matches = root_cli()
            .try_get_matches_from([
                "issue-relay",
                "transform",
                "--derived-topic",
                "github-issues",
            ])
            .unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        let mut settings = Settings::default();
        assert!(apply_overrides(sub, &mut settings).is_err());

        assert!(
            root_cli()
                .try_get_matches_from(["issue-relay", "poll", "--poll-period-secs", "0"])
                .is_err()
        );
    }
}
