use std::path::PathBuf;

use crate::checkpoint::AnalysisCheckpoint;
use crate::jobs::JobStatus;
use crate::mining::Candidate;
use crate::pnl::CostBasisMethod;
use crate::scoring::ScoredWallet;

pub const USAGE: &str = "usage: evaluator [run | analyze | collect <chain> <from> <to> | enrich | spider | \
mine <w1_from> <w1_to> <w2_from> <w2_to> | score <w1_from> <w1_to> <w2_from> <w2_to> [fifo|lifo] | status | export <path>]";

/// Inclusive block range.
pub type BlockRange = (u64, u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run,
    Analyze,
    Collect { chain: String, from: u64, to: u64 },
    Enrich,
    Spider,
    Mine { w1: BlockRange, w2: BlockRange },
    Score { w1: BlockRange, w2: BlockRange, method: Option<CostBasisMethod> },
    Status,
    Export { path: PathBuf },
}

fn block_arg(args: &mut impl Iterator<Item = String>, name: &str) -> Result<u64, String> {
    let raw = args.next().ok_or_else(|| format!("missing <{name}>\n{USAGE}"))?;
    raw.parse().map_err(|e| format!("invalid <{name}> {raw:?}: {e}"))
}

fn range_arg(args: &mut impl Iterator<Item = String>, from: &str, to: &str) -> Result<BlockRange, String> {
    let start = block_arg(args, from)?;
    let end = block_arg(args, to)?;
    if start > end {
        return Err(format!("<{from}> {start} is after <{to}> {end}"));
    }
    Ok((start, end))
}

pub fn parse_args<I>(mut args: I) -> Result<Command, String>
where
    I: Iterator<Item = String>,
{
    // Drop argv[0].
    let _ = args.next();

    let Some(cmd) = args.next() else {
        return Ok(Command::Run);
    };

    match cmd.as_str() {
        "run" => Ok(Command::Run),
        "analyze" => Ok(Command::Analyze),
        "collect" => {
            let chain = args.next().ok_or_else(|| format!("missing <chain>\n{USAGE}"))?;
            let (from, to) = range_arg(&mut args, "from", "to")?;
            Ok(Command::Collect { chain, from, to })
        }
        "enrich" => Ok(Command::Enrich),
        "spider" => Ok(Command::Spider),
        "mine" => {
            let w1 = range_arg(&mut args, "w1_from", "w1_to")?;
            let w2 = range_arg(&mut args, "w2_from", "w2_to")?;
            Ok(Command::Mine { w1, w2 })
        }
        "score" => {
            let w1 = range_arg(&mut args, "w1_from", "w1_to")?;
            let w2 = range_arg(&mut args, "w2_from", "w2_to")?;
            let method = args
                .next()
                .map(|m| m.parse::<CostBasisMethod>().map_err(|e| e.to_string()))
                .transpose()?;
            Ok(Command::Score { w1, w2, method })
        }
        "status" => Ok(Command::Status),
        "export" => {
            let path = args.next().ok_or_else(|| format!("missing <path>\n{USAGE}"))?;
            Ok(Command::Export { path: PathBuf::from(path) })
        }
        other => Err(format!("unknown command: {other}\n{USAGE}")),
    }
}

pub fn print_status(checkpoint: Option<&AnalysisCheckpoint>, jobs: &[JobStatus]) {
    match checkpoint {
        Some(cp) => print!("{}", cp.text_summary()),
        None => println!("No analysis checkpoint."),
    }
    println!();
    println!("Jobs:");
    for j in jobs {
        println!(
            "  {:<12} {:<8} last_run={} duration_ms={} error={}",
            j.job_name,
            j.status,
            j.last_run_at.as_deref().unwrap_or("-"),
            j.duration_ms.map_or_else(|| "-".to_string(), |d| d.to_string()),
            j.last_error.as_deref().unwrap_or("-"),
        );
    }
}

pub fn print_candidates(candidates: &[Candidate]) {
    println!("Candidates ({}):", candidates.len());
    for c in candidates {
        println!(
            "{}  w1_net={:>12.2}  w2_net={:>12.2}  swaps={}/{}  chains={}",
            c.wallet,
            c.w1_net,
            c.w2_net,
            c.w1_swaps,
            c.w2_swaps,
            c.chains.len()
        );
    }
}

pub fn print_scores(scored: &[ScoredWallet]) {
    println!("Rankings:");
    for (rank, s) in scored.iter().enumerate() {
        println!(
            "{:>3}  {:>6.3}  realized={:>12}  trades={:<4} {}",
            rank + 1,
            s.score,
            s.pnl.realized.round_dp(2),
            s.pnl.trades,
            s.wallet
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> impl Iterator<Item = String> {
        std::iter::once("evaluator".to_string())
            .chain(v.iter().map(|s| (*s).to_string()))
            .collect::<Vec<_>>()
            .into_iter()
    }

    #[test]
    fn test_parse_args_defaults_to_run() {
        assert_eq!(parse_args(args(&[])).unwrap(), Command::Run);
        assert_eq!(parse_args(args(&["run"])).unwrap(), Command::Run);
    }

    #[test]
    fn test_parse_collect_command() {
        let cmd = parse_args(args(&["collect", "ethereum", "100", "200"])).unwrap();
        assert_eq!(
            cmd,
            Command::Collect {
                chain: "ethereum".to_string(),
                from: 100,
                to: 200
            }
        );
    }

    #[test]
    fn test_parse_score_with_and_without_method() {
        let cmd = parse_args(args(&["score", "1", "10", "11", "20", "LIFO"])).unwrap();
        assert_eq!(
            cmd,
            Command::Score {
                w1: (1, 10),
                w2: (11, 20),
                method: Some(CostBasisMethod::Lifo)
            }
        );
        let cmd = parse_args(args(&["score", "1", "10", "11", "20"])).unwrap();
        assert!(matches!(cmd, Command::Score { method: None, .. }));
    }

    #[test]
    fn test_parse_rejects_bad_ranges_and_unknown_commands() {
        assert!(parse_args(args(&["mine", "10", "1", "11", "20"])).is_err());
        assert!(parse_args(args(&["mine", "1", "x"])).is_err());
        assert!(parse_args(args(&["collect", "ethereum"])).is_err());
        assert!(parse_args(args(&["score", "1", "2", "3", "4", "avg"])).is_err());
        assert!(parse_args(args(&["wallets"])).unwrap_err().starts_with("unknown command"));
    }

    #[test]
    fn test_parse_export_path() {
        let cmd = parse_args(args(&["export", "out/top.json"])).unwrap();
        assert_eq!(
            cmd,
            Command::Export {
                path: PathBuf::from("out/top.json")
            }
        );
    }
}
