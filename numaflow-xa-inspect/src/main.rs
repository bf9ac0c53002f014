use std::error::Error;
use std::path::Path;

use clap::ArgMatches;
use numaflow_xa::xid::{self, JobId, TransactionId};
use numaflow_xa::WriterState;
use serde_json::{Value, json};
use tracing::{debug, error};

mod cmdline;
mod setup_tracing;

const JOB_ID_HEX_LEN: usize = 32;

fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    let matches = cmdline::root_cli().get_matches();
    match run(&matches) {
        Ok(output) => {
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Err(e) => {
            error!("{e:?}");
            Err(e)
        }
    }
}

fn run(matches: &ArgMatches) -> Result<Value, Box<dyn Error>> {
    match matches.subcommand() {
        Some(("xid", args)) => {
            let job = args.get_one::<String>("job").ok_or("missing --job")?;
            let subtask = *args.get_one::<u32>("subtask").ok_or("missing --subtask")?;
            let checkpoint = *args.get_one::<u64>("checkpoint").ok_or("missing --checkpoint")?;
            let attempt = args.get_one::<u16>("attempt").copied().unwrap_or_default();
            let sub_branch = args.get_one::<u16>("sub-branch").copied().unwrap_or_default();
            let xid = xid::encode(
                &parse_job(job)?,
                subtask,
                checkpoint,
                xid::branch_suffix(attempt, sub_branch),
            );
            Ok(describe(&xid))
        }
        Some(("decode", args)) => {
            let raw = args.get_one::<String>("xid").ok_or("missing xid")?;
            Ok(describe(&raw.parse::<TransactionId>()?))
        }
        Some(("state", args)) => {
            let file = args
                .get_one::<std::path::PathBuf>("file")
                .ok_or("missing state file")?;
            describe_state(file)
        }
        _ => Err("unknown subcommand".into()),
    }
}

/// A 32 character hex string is taken as the job id itself, anything else as a job name.
fn parse_job(job: &str) -> Result<JobId, Box<dyn Error>> {
    if job.len() == JOB_ID_HEX_LEN && job.chars().all(|c| c.is_ascii_hexdigit()) {
        return Ok(JobId::from_hex(job)?);
    }
    debug!(job, "Deriving job id from name");
    Ok(JobId::from_name(job))
}

fn describe(xid: &TransactionId) -> Value {
    let mut out = json!({ "xid": xid.to_string() });
    if let Some(job_id) = xid.job_id() {
        out["job_id"] = json!(job_id.to_string());
    }
    match xid.coordinates() {
        Ok(c) => {
            out["subtask_index"] = json!(c.subtask_index);
            out["checkpoint_id"] = json!(c.checkpoint_id);
            out["attempt"] = json!(c.suffix >> 16);
            out["sub_branch"] = json!(c.suffix & 0xffff);
        }
        // not written by this sink
        Err(e) => out["error"] = json!(e.to_string()),
    }
    out
}

fn describe_state(file: &Path) -> Result<Value, Box<dyn Error>> {
    let bytes = std::fs::read(file)?;
    let state = WriterState::from_bytes(&bytes)?;
    Ok(json!({
        "file": file.display().to_string(),
        "prepared": state.prepared().iter().map(describe).collect::<Vec<_>>(),
        "hanging": state.hanging().iter().map(describe).collect::<Vec<_>>(),
    }))
}
