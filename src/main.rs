use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use cleanchat_lib::init_logging;
use cleanchat_lib::models::{GuardMode, ListItemDraft, ListKind};
use cleanchat_lib::services::{
    AppConfig, ConfigStore, DomainPolicy, FixedGuardMode, GuardAction, GuardEngine, GuardModeSource,
    ListStore, LlmToneService, RemoveOutcome, Submission, ToneService, UnavailableToneService,
};

const USAGE: &str = "Usage:
  cleanchat score <text>
  cleanchat check <text> [--domain <host>] [--mode warn|convert] [--provider <name[:model]>]
  cleanchat whitelist|blacklist add <text> [--match exact|contains|regex] [--locale ko|en|all] [--weight 1|2|3|5]
  cleanchat whitelist|blacklist list
  cleanchat whitelist|blacklist remove <id>
  cleanchat whitelist seed
  cleanchat domain disable|enable|toggle|resume|remove <domain>
  cleanchat domain pause <minutes> <domain>
  cleanchat domain list

Notes:
  - State lives in the config directory (override with CLEANCHAT_CONFIG_DIR).
  - API keys come from CLEANCHAT_<PROVIDER>_API_KEY / <PROVIDER>_API_KEY or config.json.";

/// Flags that take a value
const VALUE_FLAGS: &[&str] = &["--domain", "--mode", "--provider", "--match", "--locale", "--weight"];

fn parse_arg_value(args: &[String], key: &str) -> Option<String> {
    args.iter()
        .position(|a| a == key)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

/// Arguments that are neither flags nor flag values
fn positionals(args: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if VALUE_FLAGS.contains(&arg.as_str()) {
            skip_next = true;
            continue;
        }
        out.push(arg.clone());
    }
    out
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_store() -> Result<Arc<ConfigStore>> {
    let dir = match std::env::var("CLEANCHAT_CONFIG_DIR") {
        Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
        _ => ConfigStore::default_config_dir().ok_or_else(|| anyhow!("no config directory available"))?,
    };
    Ok(Arc::new(ConfigStore::new(dir)))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("warn");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let positional = positionals(&args);
    let Some(command) = positional.first() else {
        eprintln!("{}", USAGE);
        return Ok(());
    };

    let store = open_store()?;
    let config = store.load().map_err(anyhow::Error::msg)?;

    match command.as_str() {
        "score" => cmd_score(&store, &config, &positional[1..]).await,
        "check" => cmd_check(&store, &config, &positional[1..], &args).await,
        "whitelist" => cmd_list(&store, ListKind::Whitelist, &positional[1..], &args),
        "blacklist" => cmd_list(&store, ListKind::Blacklist, &positional[1..], &args),
        "domain" => cmd_domain(&store, &positional[1..]),
        "help" | "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("{}", USAGE);
            bail!("unknown command: {}", other)
        }
    }
}

fn joined_text(rest: &[String]) -> Result<String> {
    let text = rest.join(" ");
    if text.trim().is_empty() {
        bail!("missing <text>");
    }
    Ok(text)
}

async fn cmd_score(store: &Arc<ConfigStore>, config: &AppConfig, rest: &[String]) -> Result<()> {
    let text = joined_text(rest)?;
    let engine = GuardEngine::builder(config.guard.clone())
        .lists(Arc::new(ListStore::with_persistence(Arc::clone(store))))
        .build()
        .await;
    if engine.lexicon_degraded() {
        eprintln!("warning: lexicon sources failed, using the emergency list");
    }
    print_json(&engine.score(&text))
}

async fn cmd_check(store: &Arc<ConfigStore>, config: &AppConfig, rest: &[String], args: &[String]) -> Result<()> {
    let text = joined_text(rest)?;
    let domain = parse_arg_value(args, "--domain").unwrap_or_else(|| "localhost".to_string());
    let provider = parse_arg_value(args, "--provider");

    let mode_source: Arc<dyn GuardModeSource> = match parse_arg_value(args, "--mode") {
        Some(raw) => {
            let mode = GuardMode::parse(&raw).ok_or_else(|| anyhow!("invalid --mode: {}", raw))?;
            Arc::new(FixedGuardMode::new(mode))
        }
        None => Arc::clone(store) as Arc<dyn GuardModeSource>,
    };

    let tone: Arc<dyn ToneService> = match LlmToneService::from_config(config, Some(store.as_ref()), provider.as_deref()) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            warn!("[cli] Tone service unavailable: {}", e);
            Arc::new(UnavailableToneService)
        }
    };

    let engine = GuardEngine::builder(config.guard.clone())
        .lists(Arc::new(ListStore::with_persistence(Arc::clone(store))))
        .domains(Arc::new(DomainPolicy::with_persistence(Arc::clone(store))))
        .tone_service(tone)
        .guard_mode_source(mode_source)
        .build()
        .await;

    match engine.submit("cli", &domain, &text) {
        Submission::Allow(reason) => print_json(&json!({ "action": "allow", "reason": reason })),
        Submission::ApplyCached { converted_text } => {
            print_json(&json!({ "action": "applyCached", "convertedText": converted_text }))
        }
        Submission::Ignored => print_json(&json!({ "action": "ignored" })),
        Submission::Blocked(guard) => {
            eprintln!(
                "blocked: score={} level={:?}",
                guard.quick_assessment().score,
                guard.quick_assessment().risk_level
            );
            let action: GuardAction = guard.resolve().await;
            print_json(&action)
        }
    }
}

fn cmd_list(store: &Arc<ConfigStore>, kind: ListKind, rest: &[String], args: &[String]) -> Result<()> {
    let lists = ListStore::with_persistence(Arc::clone(store));
    let sub = rest.first().map(String::as_str).unwrap_or("list");

    match sub {
        "list" => print_json(&lists.get(kind)),
        "add" => {
            let text = joined_text(&rest[1..])?;
            let match_type = parse_arg_value(args, "--match").unwrap_or_else(|| "contains".to_string());
            let locale = parse_arg_value(args, "--locale").unwrap_or_else(|| "all".to_string());
            let mut draft = ListItemDraft::new(&text, &match_type, &locale);
            if let Some(raw) = parse_arg_value(args, "--weight") {
                let weight: u8 = raw.parse().with_context(|| format!("invalid --weight: {}", raw))?;
                draft = draft.with_weight(weight);
            }
            let item = lists.add(kind, &draft)?;
            print_json(&item)
        }
        "remove" => {
            let raw = rest.get(1).ok_or_else(|| anyhow!("missing <id>"))?;
            let id = Uuid::parse_str(raw).with_context(|| format!("invalid id: {}", raw))?;
            match lists.remove(kind, id) {
                RemoveOutcome::Removed => println!("removed {}", id),
                RemoveOutcome::NotFound => println!("not found: {}", id),
            }
            Ok(())
        }
        "seed" if kind == ListKind::Whitelist => {
            println!("added {} default entries", lists.seed_defaults());
            Ok(())
        }
        other => bail!("unknown list command: {}", other),
    }
}

fn pause_duration(minutes: i64, now: DateTime<Utc>) -> Result<Duration> {
    Duration::try_minutes(minutes)
        .filter(|d| now.checked_add_signed(*d).is_some())
        .ok_or_else(|| anyhow!("pause of {} minutes is out of range", minutes))
}

fn cmd_domain(store: &Arc<ConfigStore>, rest: &[String]) -> Result<()> {
    let policy = DomainPolicy::with_persistence(Arc::clone(store));
    let now = Utc::now();
    let sub = rest.first().map(String::as_str).unwrap_or("list");
    let domain_arg = |idx: usize| -> Result<&String> { rest.get(idx).ok_or_else(|| anyhow!("missing <domain>")) };

    let rule = match sub {
        "list" => return print_json(&policy.list()),
        "disable" => policy.set_enabled(domain_arg(1)?, false, now),
        "enable" => policy.set_enabled(domain_arg(1)?, true, now),
        "toggle" => {
            let domain = domain_arg(1)?;
            policy.toggle(domain, now);
            policy.get(domain)
        }
        "pause" => {
            let raw = rest.get(1).ok_or_else(|| anyhow!("missing <minutes>"))?;
            let minutes: i64 = raw.parse().with_context(|| format!("invalid minutes: {}", raw))?;
            if minutes <= 0 {
                bail!("pause needs a positive number of minutes");
            }
            let duration = pause_duration(minutes, now)?;
            policy.pause(domain_arg(2)?, duration, now)
        }
        "resume" => policy.resume(domain_arg(1)?, now),
        "remove" => {
            let domain = domain_arg(1)?;
            if policy.remove(domain) {
                println!("removed {}", domain);
            } else {
                println!("no rule for {}", domain);
            }
            return Ok(());
        }
        other => bail!("unknown domain command: {}", other),
    };

    let rule = rule.ok_or_else(|| anyhow!("invalid domain"))?;
    print_json(&rule)
}
