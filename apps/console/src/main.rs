use dotenv::dotenv;
use hn_auth::{AuthConfig, AuthServices};
use hn_error::{ErrorMetadataBuilder, HnError};
use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

const DEFAULT_CONFIG: &str = "configs/default.yaml";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Login { username: String, password: String },
    Navigate(Vec<String>),
    Validate,
    Sessions,
    Revoke(String),
    RevokeOthers,
    Logout,
    Status,
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Login { .. } => "login",
            Command::Navigate(_) => "navigate",
            Command::Validate => "validate",
            Command::Sessions => "sessions",
            Command::Revoke(_) => "revoke",
            Command::RevokeOthers => "revoke-others",
            Command::Logout => "logout",
            Command::Status => "status",
        }
    }
}

const KEYWORDS: &[&str] = &[
    "login",
    "navigate",
    "validate",
    "sessions",
    "revoke",
    "revoke-others",
    "logout",
    "status",
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenv().ok();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = take_flag(&mut args, "--config");
    let commands = parse_commands(&args)?;
    if commands.is_empty() {
        print_usage();
        return Ok(());
    }

    let mut cfg = load_config(config_path.as_deref())?;
    cfg.apply_env_overrides()?;
    let services = cfg.build()?;

    if let Some(session) = services.manager.restore().await? {
        info!(session_id = ?session.session_id, expires_at = %session.expires_at, "session restored");
    }

    for command in commands {
        if let Err(e) = run(&services, &command).await {
            let mut metadata = ErrorMetadataBuilder::new("hn-console").operation(command.name());
            if let Some(id) = services.manager.store().current_session().and_then(|s| s.session_id) {
                metadata = metadata.session_id(&id);
            }
            e.log(&metadata.build(&e));
            eprintln!("✗ {}", e.user_message());
        }
    }
    Ok(())
}

async fn run(services: &AuthServices, command: &Command) -> Result<(), HnError> {
    let manager = &services.manager;
    match command {
        Command::Login { username, password } => {
            let user = manager.login(username, password).await?;
            println!(
                "✓ 登录成功: {} ({}) 权限: {:?}",
                user.display_name(),
                user.role,
                sorted(user.permissions.iter())
            );
        }
        Command::Navigate(targets) => {
            for target in targets {
                let outcome = services.guard.navigate(target).await;
                let location = outcome
                    .decision
                    .location(services.guard.paths())
                    .unwrap_or_else(|| target.clone());
                println!(
                    "{} -> {:?} [{}] phases={:?}",
                    target, outcome.decision, location, outcome.phases
                );
            }
        }
        Command::Validate => {
            let validation = manager.validate().await?;
            println!("✓ 令牌有效: {}", serde_json::to_string(&validation)?);
        }
        Command::Sessions => {
            for s in manager.list_sessions().await? {
                println!(
                    "{}{} platform={} device={} last_active={}",
                    if s.is_current { "* " } else { "  " },
                    s.session_id,
                    s.platform,
                    s.device_info
                        .as_ref()
                        .map(|d| d.device_name.as_str())
                        .unwrap_or("-"),
                    s.last_active_at
                );
            }
        }
        Command::Revoke(session_id) => {
            manager.revoke_session(session_id).await?;
            println!("✓ 已吊销会话 {}", session_id);
        }
        Command::RevokeOthers => {
            let count = manager.revoke_other_sessions().await?;
            println!("✓ 已吊销 {} 个其他会话", count);
        }
        Command::Logout => {
            manager.logout().await?;
            println!("✓ 已登出");
        }
        Command::Status => match (manager.current_user(), manager.store().current_session()) {
            (Some(user), Some(session)) => println!(
                "{} ({}) session={} expires_at={} valid={}",
                user.display_name(),
                user.role,
                session.session_id.as_deref().unwrap_or("-"),
                session.expires_at,
                manager.is_authenticated()
            ),
            _ => println!("未登录"),
        },
    }
    Ok(())
}

/// 依次解析命令；`navigate` 吞掉后续直到下一个命令字的所有路径
fn parse_commands(args: &[String]) -> anyhow::Result<Vec<Command>> {
    let mut commands = Vec::new();
    let mut iter = args.iter().peekable();
    while let Some(word) = iter.next() {
        let command = match word.as_str() {
            "login" => {
                let username = iter.next().ok_or_else(|| anyhow::anyhow!("login <username> <password>"))?;
                let password = iter.next().ok_or_else(|| anyhow::anyhow!("login <username> <password>"))?;
                Command::Login {
                    username: username.clone(),
                    password: password.clone(),
                }
            }
            "navigate" => {
                let mut targets = Vec::new();
                while let Some(next) = iter.peek() {
                    if KEYWORDS.contains(&next.as_str()) {
                        break;
                    }
                    targets.push((*next).clone());
                    iter.next();
                }
                if targets.is_empty() {
                    anyhow::bail!("navigate <path>...");
                }
                Command::Navigate(targets)
            }
            "validate" => Command::Validate,
            "sessions" => Command::Sessions,
            "revoke" => {
                let id = iter.next().ok_or_else(|| anyhow::anyhow!("revoke <session_id>"))?;
                Command::Revoke(id.clone())
            }
            "revoke-others" => Command::RevokeOthers,
            "logout" => Command::Logout,
            "status" => Command::Status,
            other => anyhow::bail!("unknown command '{}'", other),
        };
        commands.push(command);
    }
    Ok(commands)
}

fn take_flag(args: &mut Vec<String>, flag: &str) -> Option<String> {
    let pos = args.iter().position(|a| a == flag)?;
    if pos + 1 >= args.len() {
        args.remove(pos);
        return None;
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Some(value)
}

fn load_config(path: Option<&str>) -> anyhow::Result<AuthConfig> {
    let path = path.unwrap_or(DEFAULT_CONFIG);
    if !Path::new(path).exists() && path == DEFAULT_CONFIG {
        info!("{} not found; using built-in defaults", DEFAULT_CONFIG);
        return Ok(AuthConfig::default());
    }
    let cfg = AuthConfig::from_file(path)?;
    info!(path, routes = cfg.routes.len(), "load_config");
    Ok(cfg)
}

fn sorted<'a>(items: impl Iterator<Item = &'a String>) -> Vec<&'a str> {
    let mut v: Vec<&str> = items.map(String::as_str).collect();
    v.sort_unstable();
    v
}

fn print_usage() {
    println!("usage: hn-console [--config <file>] <command>...");
    println!("  login <username> <password>");
    println!("  navigate <path>...");
    println!("  validate | sessions | revoke <session_id> | revoke-others | logout | status");
}

fn init_tracing() {
    let fmt_layer = fmt::layer().with_target(false);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = Registry::default().with(filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber).ok();
}
