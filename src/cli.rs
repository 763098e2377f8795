use clap::{Arg, Command};
use std::time::Duration;

use crate::pinger::{DEFAULT_PACKET_SIZE, Options};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PingArgs {
    pub target: String,
    pub count: u32,
    pub size: usize,
    pub timeout: u64,
}

impl Default for PingArgs {
    fn default() -> Self {
        Self {
            target: String::new(),
            count: 0,
            size: DEFAULT_PACKET_SIZE,
            timeout: 1,
        }
    }
}

impl PingArgs {
    pub fn options(&self) -> Options {
        Options {
            timeout: Duration::from_secs(self.timeout),
            count: self.count,
            packet_size: self.size,
        }
        .normalized()
    }
}

pub fn build_cli() -> Command {
    Command::new("rping")
        .version("0.1.0")
        .about("Send ICMP echo requests to a network host")
        .arg(
            Arg::new("target")
                .help("Target hostname or IPv4 address")
                .required(true)
                .index(1)
        )
        .arg(
            Arg::new("count")
                .short('c')
                .long("count")
                .help("Number of packets to send; sends until interrupted when omitted")
                .value_name("count")
                .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("size")
                .short('s')
                .long("size")
                .help("Number of data bytes to send in each request")
                .value_name("size")
                .value_parser(clap::value_parser!(usize))
        )
        .arg(
            Arg::new("timeout")
                .short('t')
                .long("timeout")
                .help("Timeout in seconds to wait for each reply")
                .value_name("seconds")
                .value_parser(clap::value_parser!(u64))
        )
}

pub fn parse_args() -> anyhow::Result<PingArgs> {
    args_from_matches(&build_cli().get_matches())
}

fn args_from_matches(matches: &clap::ArgMatches) -> anyhow::Result<PingArgs> {
    let mut args = PingArgs::default();

    args.target = matches
        .get_one::<String>("target")
        .ok_or_else(|| anyhow::anyhow!("missing target host"))?
        .clone();

    if let Some(count) = matches.get_one::<u32>("count") {
        args.count = *count;
    }

    if let Some(size) = matches.get_one::<usize>("size") {
        args.size = *size;
    }

    if let Some(timeout) = matches.get_one::<u64>("timeout") {
        args.timeout = *timeout;
    }

    Ok(args)
}
