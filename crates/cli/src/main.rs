//! sidmap command-line administration tool.
//!
//! Generates and validates configuration files, manages name rules,
//! runs single mappings through the resolution engine, and inspects or
//! clears the mapping cache.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use sidmap_core::config::AppConfig;
use sidmap_core::engine::{Engine, WorkerContext};
use sidmap_core::models::{Direction, IdKind, IdType, MappingRequest, MappingResult};
use sidmap_core::rules::{NameRule, RuleFilter, StoredRule};
use sidmap_core::service::{Batch, WorkerPool};
use sidmap_core::Sid;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// sidmap command-line administration tool.
#[derive(Parser, Debug)]
#[command(
    name = "sidmap",
    version,
    about = "Manage and query the Windows SID to Unix id mapping service"
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, global = true, default_value = "/etc/sidmap/config.toml")]
    config: PathBuf,

    /// Log filter, e.g. "debug" or "sidmap_core=trace". Overrides the
    /// config file's service.log_level.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./sidmap.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,

    /// Manage name rules.
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Resolve a single identity through the engine.
    Map {
        #[command(subcommand)]
        action: MapAction,
    },

    /// Inspect or clear the mapping cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand, Debug)]
enum RulesAction {
    /// List name rules.
    List {
        /// Only user rules.
        #[arg(long, conflicts_with = "groups")]
        users: bool,
        /// Only group rules.
        #[arg(long)]
        groups: bool,
    },
    /// Add a name rule.
    Add {
        /// Windows name, `*` for any, `""` to deny.
        winname: String,
        /// Unix name, `*` for the same name, `""` to deny.
        unixname: String,
        /// Windows domain; the configured mapping domain when omitted.
        #[arg(short, long)]
        domain: Option<String>,
        /// Rule applies to groups rather than users.
        #[arg(long)]
        group: bool,
        #[arg(long, value_enum, default_value = "bi")]
        direction: DirectionArg,
    },
    /// Remove the name rules matching every given field.
    Remove {
        #[arg(long)]
        winname: Option<String>,
        #[arg(short, long)]
        domain: Option<String>,
        #[arg(long)]
        unixname: Option<String>,
        #[arg(long)]
        group: bool,
        #[arg(long, value_enum)]
        direction: Option<DirectionArg>,
    },
    /// Remove every user (or group) rule.
    Flush {
        #[arg(long)]
        group: bool,
    },
}

#[derive(Subcommand, Debug)]
enum MapAction {
    /// Map a SID to a unix id.
    Sid {
        sid: String,
        #[arg(long = "as", value_enum, default_value = "posix")]
        wanted: WantedArg,
    },
    /// Map a Windows account, `name` or `name@domain`, to a unix id.
    Name {
        name: String,
        #[arg(long = "as", value_enum, default_value = "posix")]
        wanted: WantedArg,
    },
    /// Map a uid to a SID.
    Uid { id: u32 },
    /// Map a gid to a SID.
    Gid { id: u32 },
    /// Map a unix user name to a SID.
    User { name: String },
    /// Map a unix group name to a SID.
    Group { name: String },
}

#[derive(Subcommand, Debug)]
enum CacheAction {
    /// Show cached id mappings, most recent first.
    Show {
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },
    /// Clear the cache.
    Flush {
        /// Only drop expired rows.
        #[arg(long)]
        expired: bool,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum DirectionArg {
    Bi,
    W2u,
    U2w,
}

impl From<DirectionArg> for Direction {
    fn from(d: DirectionArg) -> Self {
        match d {
            DirectionArg::Bi => Direction::Bi,
            DirectionArg::W2u => Direction::W2u,
            DirectionArg::U2w => Direction::U2w,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum WantedArg {
    Uid,
    Gid,
    Posix,
}

impl From<WantedArg> for IdType {
    fn from(w: WantedArg) -> Self {
        match w {
            WantedArg::Uid => IdType::Uid,
            WantedArg::Gid => IdType::Gid,
            WantedArg::Posix => IdType::PosixId,
        }
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = cli
        .log_level
        .clone()
        .or_else(|| {
            AppConfig::load_from_file(&cli.config)
                .ok()
                .map(|c| c.service.log_level)
        })
        .unwrap_or_else(|| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let json = cli.json;
    match cli.command {
        Commands::Init { output } => cmd_init(&output),
        Commands::Validate => cmd_validate(&cli.config),
        Commands::Rules { action } => {
            let ctx = open_context(&cli.config)?;
            cmd_rules(&ctx, action, json)
        }
        Commands::Map { action } => {
            let config = load_config(&cli.config)?;
            let engine = Arc::new(Engine::from_config(&config).context("failed to start engine")?);
            cmd_map(engine, action, json).await
        }
        Commands::Cache { action } => {
            let ctx = open_context(&cli.config)?;
            cmd_cache(&ctx, action, json)
        }
    }
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn load_config(path: &Path) -> Result<AppConfig> {
    AppConfig::load_and_resolve(path).context("failed to load configuration file")
}

fn open_context(path: &Path) -> Result<WorkerContext> {
    let config = load_config(path)?;
    debug!(data_dir = %config.service.data_dir.display(), "opening mapping stores");
    let engine = Engine::from_config(&config).context("failed to start engine")?;
    WorkerContext::open(Arc::new(engine)).context("failed to open mapping stores")
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

fn cmd_init(output: &Path) -> Result<()> {
    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    let body = AppConfig::default()
        .to_toml()
        .context("failed to render default configuration")?;
    let contents = format!(
        "# sidmap configuration\n\
         #\n\
         # Add a [directory] section to resolve domain accounts over LDAP:\n\
         #\n\
         # [directory]\n\
         # ldap_url = \"ldap://dc.corp.example.com\"\n\
         # base_dn = \"dc=corp,dc=example,dc=com\"\n\
         # bind_dn = \"cn=sidmap,cn=Users,dc=corp,dc=example,dc=com\"\n\
         # bind_password_env = \"SIDMAP_LDAP_PASSWORD\"\n\
         \n{body}"
    );
    std::fs::write(output, contents).context("failed to write config file")?;

    println!("Default configuration written to {}", output.display());
    println!();
    println!("Next steps:");
    println!("  1. Set mapping.machine_sid and mapping.mapping_domain");
    println!("  2. Configure the directory, if any, and export its password variable");
    println!("  3. Validate with: sidmap validate --config {}", output.display());

    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  [OK] TOML structure is valid");

    let warnings = env_warnings(&mut config);
    if warnings.is_empty() {
        println!("  [OK] Environment variable references processed");
    }
    for warning in &warnings {
        println!("  [WARN] {}", warning);
    }

    match config.validate() {
        Ok(()) => println!("  [OK] All required fields are valid"),
        Err(e) => {
            println!("  [FAIL] Validation error: {}", e);
            anyhow::bail!("configuration validation failed");
        }
    }

    println!();
    println!("Configuration summary:");
    println!("  Data directory : {}", config.service.data_dir.display());
    println!("  Workers        : {}", config.service.workers);
    println!(
        "  Machine SID    : {}",
        config.mapping.machine_sid.as_deref().unwrap_or("not set")
    );
    println!(
        "  Mapping domain : {}",
        config.mapping.mapping_domain.as_deref().unwrap_or("not set")
    );
    println!(
        "  Cache TTLs     : {}s ids, {}s names",
        config.mapping.id_cache_ttl_secs, config.mapping.name_cache_ttl_secs
    );
    match &config.directory {
        Some(dir) => {
            println!("  Directory      : {} ({})", dir.ldap_url, dir.base_dn);
            println!(
                "  Bind password  : {}",
                if dir.bind_password.is_some() {
                    "set"
                } else {
                    "NOT SET"
                }
            );
        }
        None => println!("  Directory      : none"),
    }
    println!("  Ephemeral block: {}", config.ephemeral.block_size);
    println!(
        "  Unknown SIDs   : {}",
        if config.mapping.ephemeral_unresolved_sids {
            "ephemeral id"
        } else {
            "fail"
        }
    );
    println!();
    println!("Configuration is valid.");

    Ok(())
}

/// Resolve `*_env` references, collecting problems instead of failing on
/// them.
fn env_warnings(config: &mut AppConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    if let Err(e) = config.resolve_env_vars() {
        warnings.push(e.to_string());
    }
    if let Some(dir) = &config.directory {
        if let (Some(var), None) = (&dir.bind_password_env, &dir.bind_password) {
            warnings.push(format!(
                "directory.bind_password_env: environment variable {var} is not set or empty"
            ));
        }
    }
    warnings
}

fn cmd_rules(ctx: &WorkerContext, action: RulesAction, json: bool) -> Result<()> {
    match action {
        RulesAction::List { users, groups } => {
            let filter = match (users, groups) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let rules = ctx.list_rules(filter).context("failed to list rules")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&rules)?);
            } else if rules.is_empty() {
                println!("No name rules defined.");
            } else {
                println!("{}", rules_table(&rules));
                println!("{} rule(s)", rules.len());
            }
            Ok(())
        }

        RulesAction::Add {
            winname,
            unixname,
            domain,
            group,
            direction,
        } => {
            let rule = NameRule::new(!group, winname, domain.as_deref(), unixname, direction.into());
            ctx.add_rule(&rule).context("failed to add rule")?;
            println!("Rule added.");
            Ok(())
        }

        RulesAction::Remove {
            winname,
            domain,
            unixname,
            group,
            direction,
        } => {
            let filter = RuleFilter {
                is_user: !group,
                windomain: domain,
                winname,
                unixname,
                direction: direction.map(Direction::from),
            };
            if filter.is_empty() {
                anyhow::bail!("name at least one of --winname, --domain, --unixname, --direction");
            }
            let n = ctx.remove_rules(&filter).context("failed to remove rules")?;
            println!("{} rule(s) removed.", n);
            Ok(())
        }

        RulesAction::Flush { group } => {
            let n = ctx.flush_rules(!group).context("failed to flush rules")?;
            println!("{} rule(s) removed.", n);
            Ok(())
        }
    }
}

async fn cmd_map(engine: Arc<Engine>, action: MapAction, json: bool) -> Result<()> {
    let (label, batch) = match action {
        MapAction::Name { name, wanted } => return map_name(engine, name, wanted, json).await,
        MapAction::Sid { sid, wanted } => {
            let parsed = Sid::parse(&sid).context("invalid SID")?;
            (sid, Batch::SidsToIds(vec![MappingRequest::sid_to_id(parsed, wanted.into())]))
        }
        MapAction::Uid { id } => (
            format!("uid {id}"),
            Batch::IdsToSids(vec![MappingRequest::id_to_sid(IdKind::Uid, id)]),
        ),
        MapAction::Gid { id } => (
            format!("gid {id}"),
            Batch::IdsToSids(vec![MappingRequest::id_to_sid(IdKind::Gid, id)]),
        ),
        MapAction::User { name } => (name.clone(), unix_name_batch(&engine, IdKind::Uid, &name)?),
        MapAction::Group { name } => (name.clone(), unix_name_batch(&engine, IdKind::Gid, &name)?),
    };

    let pool = WorkerPool::start(engine, 1).context("failed to open mapping stores")?;
    let results = pool.submit(batch).await;
    pool.shutdown().await;
    let result = results
        .context("mapping worker stopped")?
        .pop()
        .context("no result returned")?;
    print_result(&label, None, &result, json)
}

/// Windows account lookups go through the worker context directly. The
/// directory client blocks, so this runs off the async workers.
async fn map_name(engine: Arc<Engine>, name: String, wanted: WantedArg, json: bool) -> Result<()> {
    let label = name.clone();
    let (sid, result) = tokio::task::spawn_blocking(move || -> Result<_> {
        let ctx = WorkerContext::open(engine).context("failed to open mapping stores")?;
        let (account, domain) = match name.split_once('@') {
            Some((n, d)) => (n, Some(d)),
            None => (name.as_str(), None),
        };
        ctx.resolve_name_to_id(account, domain, IdType::from(wanted))
            .with_context(|| format!("cannot resolve '{name}'"))
    })
    .await
    .context("name lookup task failed")??;
    print_result(&label, Some(&sid), &result, json)
}

fn unix_name_batch(engine: &Engine, kind: IdKind, name: &str) -> Result<Batch> {
    let id = engine
        .names()
        .lookup_by_name(kind, name)
        .with_context(|| format!("no unix {} named '{name}'", kind_noun(kind)))?;
    Ok(Batch::IdsToSids(vec![
        MappingRequest::id_to_sid(kind, id).with_name(name, None),
    ]))
}

fn cmd_cache(ctx: &WorkerContext, action: CacheAction, json: bool) -> Result<()> {
    match action {
        CacheAction::Show { limit } => {
            let rows = ctx
                .cache()
                .list_id_mappings(limit)
                .context("failed to read cache")?;
            if json {
                let out: Vec<_> = rows
                    .iter()
                    .map(|r| {
                        json!({
                            "sid": r.sid.to_string(),
                            "windomain": r.windomain,
                            "winname": r.winname,
                            "kind": IdKind::from_is_user(r.is_user),
                            "pid": r.pid,
                            "unixname": r.unixname,
                            "w2u": r.w2u,
                            "u2w": r.u2w,
                            "expiration": r.expiration,
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }
            if rows.is_empty() {
                println!("Cache is empty.");
                return Ok(());
            }

            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_content_arrangement(ContentArrangement::Dynamic);
            table.set_header(vec!["SID", "Windows name", "Id", "Unix name", "Dir", "Expires"]);
            for r in &rows {
                let winname = match (&r.winname, &r.windomain) {
                    (Some(n), Some(d)) => format!("{n}@{d}"),
                    (Some(n), None) => n.clone(),
                    _ => "-".to_string(),
                };
                let dir = match (r.w2u, r.u2w) {
                    (true, true) => "<->",
                    (true, false) => "->",
                    (false, true) => "<-",
                    (false, false) => "-",
                };
                table.add_row(vec![
                    Cell::new(r.sid.to_string()),
                    Cell::new(winname),
                    Cell::new(format!("{} {}", IdKind::from_is_user(r.is_user), r.pid)),
                    Cell::new(r.unixname.as_deref().unwrap_or("-")),
                    Cell::new(dir),
                    Cell::new(format_expiry(r.expiration)),
                ]);
            }
            println!("{table}");
            println!("{} row(s) shown", rows.len());
            Ok(())
        }

        CacheAction::Flush { expired } => {
            if expired {
                let n = ctx.cache().purge_expired().context("failed to purge cache")?;
                println!("{} expired row(s) removed.", n);
            } else {
                ctx.cache().clear().context("failed to clear cache")?;
                println!("Cache cleared.");
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn rules_table(rules: &[StoredRule]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Type", "Windows name", "Unix name", "Direction", "Order"]);
    for r in rules {
        let winname = match r.windomain.as_deref().filter(|d| !d.is_empty()) {
            Some(d) => format!("{}@{}", display_name(&r.winname), d),
            None => display_name(&r.winname),
        };
        let order = format!(
            "{}/{}",
            r.w2u_order.map_or("-".to_string(), |o| o.to_string()),
            r.u2w_order.map_or("-".to_string(), |o| o.to_string()),
        );
        table.add_row(vec![
            Cell::new(if r.is_user { "user" } else { "group" }),
            Cell::new(winname),
            Cell::new(display_name(&r.unixname)),
            Cell::new(r.direction().map_or("-".to_string(), |d| d.to_string())),
            Cell::new(order),
        ]);
    }
    table
}

fn print_result(label: &str, sid: Option<&Sid>, result: &MappingResult, json: bool) -> Result<()> {
    if json {
        let out = json!({
            "input": label,
            "sid": sid.map(|s| s.to_string()),
            "id": result.id,
            "direction": result.direction,
            "name": result.name,
            "domain": result.domain,
            "status": match &result.status {
                Ok(()) => "ok".to_string(),
                Err(e) => e.to_string(),
            },
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Input     : {}", label);
    if let Some(sid) = sid {
        println!("SID       : {}", sid);
    }
    match &result.status {
        Ok(()) => {
            let id = result
                .id
                .as_ref()
                .map_or("-".to_string(), |id| id.to_string());
            println!("Maps to   : {}", id);
            println!("Direction : {}", result.direction);
            if let Some(name) = &result.name {
                match &result.domain {
                    Some(domain) if !domain.is_empty() => println!("Name      : {name}@{domain}"),
                    _ => println!("Name      : {name}"),
                }
            }
            Ok(())
        }
        Err(e) => anyhow::bail!("no mapping for {label}: {e}"),
    }
}

fn display_name(name: &str) -> String {
    if name.is_empty() {
        "\"\"".to_string()
    } else {
        name.to_string()
    }
}

fn kind_noun(kind: IdKind) -> &'static str {
    match kind {
        IdKind::Uid => "user",
        IdKind::Gid => "group",
    }
}

fn format_expiry(expiration: Option<i64>) -> String {
    match expiration {
        None | Some(0) | Some(i64::MAX) => "never".to_string(),
        Some(ts) => chrono::DateTime::from_timestamp(ts, 0)
            .map_or_else(|| ts.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string()),
    }
}
