use std::collections::BTreeMap;
use std::sync::Arc;

use m365_deck_lib::auth::{
    AccountHandle, ApplicationIdentity, ConsentChallenge, ConsentPresenter, InteractionPolicy,
    Readiness,
};
use m365_deck_lib::{init_logging, PluginConfig, PluginContext};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Debug)]
struct CliArgs {
    command: String,
    format: OutputFormat,
    positional: Vec<String>,
    pretty: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AccountPayload {
    account: String,
    name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusPayload {
    app_id: String,
    account: String,
    ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Prints the device code so the user can finish sign-in in a browser
struct TerminalPresenter;

impl ConsentPresenter for TerminalPresenter {
    fn present(&self, app: &ApplicationIdentity, challenge: &ConsentChallenge) {
        match challenge.message.as_deref() {
            Some(message) => eprintln!("{message}"),
            None => eprintln!(
                "To sign in for {app}, open {} and enter the code {}",
                challenge.verification_uri, challenge.user_code
            ),
        }
    }
}

#[tokio::main]
async fn main() {
    init_logging();

    let args = parse_args(std::env::args().skip(1).collect());
    if args.command == "--help" || args.command == "-h" {
        print_help();
        return;
    }
    if args.command == "--version" || args.command == "-V" {
        println!("m365-deck {}", env!("CARGO_PKG_VERSION"));
        return;
    }

    let context = PluginContext::from_config(PluginConfig::load(), Arc::new(TerminalPresenter));
    let result = match args.command.as_str() {
        "accounts" => run_accounts(&context, &args).await,
        "login" => run_login(&context, &args).await,
        "revoke" => run_revoke(&context, &args).await,
        "status" => run_status(&context, &args).await,
        _ => Err(format!(
            "Unknown command: {}. Use --help for usage.",
            args.command
        )),
    };

    if let Err(message) = result {
        eprintln!("{message}");
        std::process::exit(1);
    }
}

fn parse_args(mut argv: Vec<String>) -> CliArgs {
    let mut format = OutputFormat::Text;
    let mut pretty = false;
    let mut command = String::new();
    let mut positional = Vec::new();

    if let Some(first) = argv.first() {
        if !first.starts_with('-') {
            command = argv.remove(0);
        }
    }

    if command.is_empty() {
        command = "--help".to_string();
    }

    let mut iter = argv.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--format" => {
                if let Some(value) = iter.next() {
                    if value == "json" {
                        format = OutputFormat::Json;
                    } else if value == "text" {
                        format = OutputFormat::Text;
                    }
                }
            }
            "--json" => format = OutputFormat::Json,
            "--pretty" => pretty = true,
            "--help" | "-h" | "--version" | "-V" => {
                command = arg;
                break;
            }
            value if !value.starts_with('-') => positional.push(arg),
            _ => {}
        }
    }

    CliArgs {
        command,
        format,
        positional,
        pretty,
    }
}

fn app_arg(args: &CliArgs) -> Result<ApplicationIdentity, String> {
    let app = ApplicationIdentity::new(args.positional.first().cloned().unwrap_or_default());
    if app.is_empty() {
        return Err(format!("{} needs an application id", args.command));
    }
    Ok(app)
}

fn account_arg(args: &CliArgs) -> Result<AccountHandle, String> {
    args.positional
        .get(1)
        .and_then(|value| AccountHandle::from_settings(value))
        .ok_or_else(|| format!("{} needs an account", args.command))
}

async fn run_accounts(context: &PluginContext, args: &CliArgs) -> Result<(), String> {
    let app = app_arg(args)?;
    let accounts = context.directory().list(&app).await;

    match args.format {
        OutputFormat::Text => println!("{}", render_accounts_text(&app, &accounts)),
        OutputFormat::Json => {
            let payload: Vec<AccountPayload> = accounts
                .into_iter()
                .map(|(handle, name)| AccountPayload {
                    account: handle.to_string(),
                    name,
                })
                .collect();
            print_json(&payload, args.pretty)?;
        }
    }
    Ok(())
}

async fn run_login(context: &PluginContext, args: &CliArgs) -> Result<(), String> {
    let app = app_arg(args)?;
    let handle = context
        .configure(app.as_str(), None)
        .start_new_account_flow()
        .await
        .map_err(|err| err.to_string())?;

    let name = context
        .directory()
        .list(&app)
        .await
        .remove(&handle)
        .unwrap_or_default();

    match args.format {
        OutputFormat::Text => println!("Signed in as {name} ({handle})"),
        OutputFormat::Json => print_json(
            &AccountPayload {
                account: handle.to_string(),
                name,
            },
            args.pretty,
        )?,
    }
    Ok(())
}

async fn run_revoke(context: &PluginContext, args: &CliArgs) -> Result<(), String> {
    let app = app_arg(args)?;
    let handle = account_arg(args)?;
    context
        .directory()
        .revoke(&app, &handle)
        .await
        .map_err(|err| err.to_string())?;

    if args.format == OutputFormat::Text {
        println!("Removed {handle} from {app}");
    }
    Ok(())
}

async fn run_status(context: &PluginContext, args: &CliArgs) -> Result<(), String> {
    let app = app_arg(args)?;
    let handle = account_arg(args)?;
    let session = context.configure(app.as_str(), Some(handle.as_str()));

    let (ready, error) = match session.initialize(InteractionPolicy::SilentOnly).await {
        Readiness::Ready => (true, None),
        Readiness::Unready(err) => (false, Some(err.to_string())),
    };
    let payload = StatusPayload {
        app_id: app.to_string(),
        account: handle.to_string(),
        ready,
        error,
    };

    match args.format {
        OutputFormat::Text => println!("{}", render_status_text(&payload)),
        OutputFormat::Json => print_json(&payload, args.pretty)?,
    }
    Ok(())
}

fn render_accounts_text(app: &ApplicationIdentity, accounts: &BTreeMap<AccountHandle, String>) -> String {
    let mut lines = vec![format!("== Accounts for {app} ==")];
    if accounts.is_empty() {
        lines.push("No cached accounts".to_string());
    }
    for (handle, name) in accounts {
        lines.push(format!("{name}  {handle}"));
    }
    lines.join("\n")
}

fn render_status_text(payload: &StatusPayload) -> String {
    let mut line = format!(
        "{} @ {}: {}",
        payload.account,
        payload.app_id,
        if payload.ready { "ready" } else { "not ready" }
    );
    if let Some(error) = payload.error.as_ref() {
        line.push_str(" - ");
        line.push_str(error);
    }
    line
}

fn print_json<T: Serialize>(payload: &T, pretty: bool) -> Result<(), String> {
    let output = if pretty {
        serde_json::to_string_pretty(payload)
    } else {
        serde_json::to_string(payload)
    }
    .map_err(|err| err.to_string())?;
    println!("{output}");
    Ok(())
}

fn print_help() {
    println!(
        "m365-deck {}

Usage:
  m365-deck accounts <app-id>            List cached accounts
  m365-deck login <app-id>               Add an account (device code sign-in)
  m365-deck revoke <app-id> <account>    Remove a cached account
  m365-deck status <app-id> <account>    Check that an account signs in silently

Options:
  --format text|json   Output format (default: text)
  --json               Shorthand for --format json
  --pretty             Pretty-print JSON
  -h, --help           Show this help
  -V, --version        Show the version",
        env!("CARGO_PKG_VERSION")
    );
}
