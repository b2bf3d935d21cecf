use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Run, dispatch and stream local jobs, and watch their output over grid channels
#[derive(Debug, Parser)]
#[clap(name = "gridctl", version)]
pub struct ArgParser {
    /// JSON configuration file
    #[clap(long, global = true, env = "GRID_CONFIG")]
    pub config: Option<PathBuf>,
    /// The sub-command to use
    #[clap(subcommand)]
    pub sub_command: SubCommand,
}

#[derive(Clone, Debug, PartialEq, Subcommand)]
pub enum SubCommand {
    /// run one job to completion and print its result
    Run {
        #[clap(long, parse(try_from_str = seconds))]
        /// give up after this many seconds
        timeout: Option<Duration>,

        #[clap(long)]
        /// free-form label copied onto the job
        tag: Option<String>,

        #[clap(long)]
        /// also publish the result on this channel socket
        publish: Option<PathBuf>,

        #[clap(raw = true, required = true)]
        /// the command and its args, after `--`
        argv: Vec<String>,
    },
    /// run every command line read from stdin in the worker pool
    Dispatch {
        #[clap(long)]
        /// also publish every output line on this channel socket
        publish: Option<PathBuf>,

        #[clap(long)]
        /// worker pool size
        workers: Option<usize>,
    },
    /// stream the output of jobs bound to a named stream
    Stream {
        /// name of the stream
        name: String,

        #[clap(long = "job", required = true, multiple_occurrences = true)]
        /// a command line to submit to the stream
        jobs: Vec<String>,

        #[clap(long)]
        /// keep streaming until interrupted
        follow: bool,
    },
    /// print output lines published on a channel
    Tail {
        /// channel socket path
        endpoint: PathBuf,
    },
    /// print job results published on a channel
    Watch {
        /// channel socket path
        endpoint: PathBuf,
    },
}

/// try_from_str parse function for timeouts
fn seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|_| format!("not a number: {}", s))?;
    if secs.is_finite() && secs > 0.0 {
        Ok(Duration::from_secs_f64(secs))
    } else {
        Err("timeout must be a positive number of seconds".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run() {
        let args = ArgParser::try_parse_from([
            "gridctl", "run", "--timeout", "1.5", "--tag", "t", "--", "sh", "-c", "echo hi",
        ])
        .unwrap();
        assert_eq!(
            args.sub_command,
            SubCommand::Run {
                timeout: Some(Duration::from_millis(1500)),
                tag: Some("t".to_string()),
                publish: None,
                argv: vec!["sh".into(), "-c".into(), "echo hi".into()],
            }
        );
    }

    #[test]
    fn parses_stream_jobs() {
        let args = ArgParser::try_parse_from([
            "gridctl", "--config", "grid.json", "stream", "builds", "--job", "echo a", "--job",
            "echo b",
        ])
        .unwrap();
        assert_eq!(args.config, Some(PathBuf::from("grid.json")));
        match args.sub_command {
            SubCommand::Stream { name, jobs, follow } => {
                assert_eq!(name, "builds");
                assert_eq!(jobs, vec!["echo a", "echo b"]);
                assert!(!follow);
            }
            other => panic!("unexpected sub-command {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_timeout() {
        assert!(seconds("-1").is_err());
        assert!(seconds("soon").is_err());
        assert!(ArgParser::try_parse_from(["gridctl", "run", "--timeout", "0", "--", "true"]).is_err());
    }
}
