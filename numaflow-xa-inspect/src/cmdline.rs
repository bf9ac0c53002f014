use clap::{Arg, ArgAction, Command};

pub(super) fn root_cli() -> Command {
    Command::new("numaflow-xa-inspect")
        .author("Numaflow Authors")
        .about("Inspect transaction ids and checkpointed writer state of the XA sink")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_xid_subcommand())
        .subcommand(add_decode_subcommand())
        .subcommand(add_state_subcommand())
}

fn add_xid_subcommand() -> Command {
    Command::new("xid")
        .about("Print the transaction id a subtask uses for a checkpoint")
        .arg_required_else_help(true)
        .arg(
            Arg::new("job")
                .long("job")
                .help("Job name, or the job id as 32 hex characters")
                .required(true)
                .action(ArgAction::Set)
                .value_parser(clap::value_parser!(String)),
        )
        .arg(
            Arg::new("subtask")
                .long("subtask")
                .help("Index of the subtask")
                .required(true)
                .value_parser(clap::value_parser!(u32)),
        )
        .arg(
            Arg::new("checkpoint")
                .long("checkpoint")
                .help("Checkpoint id")
                .required(true)
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("attempt")
                .long("attempt")
                .help("Attempt number of the subtask")
                .default_value("0")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("sub-branch")
                .long("sub-branch")
                .help("Branch number within the checkpoint, raised on every abandoned branch")
                .default_value("0")
                .value_parser(clap::value_parser!(u16)),
        )
}

fn add_decode_subcommand() -> Command {
    Command::new("decode")
        .about("Decode a transaction id printed as <format>:<global hex>:<branch hex>")
        .arg_required_else_help(true)
        .arg(
            Arg::new("xid")
                .help("Transaction id")
                .required(true)
                .value_parser(clap::value_parser!(String)),
        )
}

fn add_state_subcommand() -> Command {
    Command::new("state")
        .about("Print a persisted writer state file with the decoded branches")
        .arg_required_else_help(true)
        .arg(
            Arg::new("file")
                .help("Path of the state file")
                .required(true)
                .value_parser(clap::value_parser!(std::path::PathBuf)),
        )
}
