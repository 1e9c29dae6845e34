//! electrum-session CLI - connect, log in, query, print JSON.
//!
//!   electrum-session [smoke]        → run the session smoke checks
//!   electrum-session address [-c internal] [-i 5] [-s 1]
//!   electrum-session balance [--confs N]
//!   electrum-session transactions [--offset N] [--count N]
//!   electrum-session fees
//!
//! Connection:
//!   --network <name>   mainnet | testnet | signet | regtest (default testnet)
//!   --url <url>        host:port[:t|s[:noverify]] or tcp:// / ssl://
//!   --tls / --no-tls   override the protocol
//!   --noverify         skip certificate domain validation (insecure)
//!   --tor              route through the SOCKS5 proxy (--proxy, default 127.0.0.1:9050)
//!
//! Wallet:
//!   --mnemonic <words> --passphrase <text> --data-dir <dir>
//!   --accounts <n>     load subaccounts 0..n, --subaccount <n> selects one
//!
//! Environment (lower priority than flags): SESSION_MNEMONIC, SESSION_PASSPHRASE,
//! SESSION_NETWORK, SESSION_URL, SESSION_TLS, SESSION_DATADIR.

use anyhow::{anyhow, bail, Context, Result};
use electrum_session::logging::init_logging;
use electrum_session::{
    BalanceOptions, ChainType, LogLevel, NetworkParameters, ReceiveAddressOptions, Session, SessionConfig,
    TransactionsOptions,
};
use serde_json::{json, Value};
use std::env;
use std::io::IsTerminal;
use tracing::info;

const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

fn main() {
    let args: Vec<String> = env::args().collect();
    let opts = ParsedArgs::parse(&args[1..]);

    if opts.help {
        print_usage();
        return;
    }
    if opts.version {
        println!("electrum-session {}", env!("CARGO_PKG_VERSION"));
        return;
    }
    init_logging(opts.log_level);

    let result = tokio::runtime::Runtime::new()
        .context("failed to create runtime")
        .and_then(|rt| rt.block_on(run(&opts)));

    let pretty = opts.pretty || std::io::stdout().is_terminal();
    match result {
        Ok(output) => println!("{}", render(&output, pretty)),
        Err(e) => {
            eprintln!("{}", render(&json!({ "error": format!("{:#}", e) }), pretty));
            std::process::exit(1);
        }
    }
}

fn render(value: &Value, pretty: bool) -> String {
    let rendered = if pretty { serde_json::to_string_pretty(value) } else { serde_json::to_string(value) };
    rendered.unwrap_or_else(|_| value.to_string())
}

#[derive(Default)]
struct ParsedArgs {
    command: Option<String>,
    network: Option<String>,
    url: Option<String>,
    tls: Option<bool>,
    noverify: bool,
    tor: bool,
    proxy: Option<String>,
    mnemonic: Option<String>,
    passphrase: Option<String>,
    data_dir: Option<String>,
    chain: Option<String>,
    index: Option<u32>,
    accounts: Option<u32>,
    subaccount: u32,
    confs: u32,
    offset: usize,
    count: Option<usize>,
    log_level: LogLevel,
    pretty: bool,
    help: bool,
    version: bool,
}

impl ParsedArgs {
    fn parse(args: &[String]) -> Self {
        let mut opts = ParsedArgs::default();
        let mut positional = Vec::new();
        let mut i = 0;

        while i < args.len() {
            let arg = &args[i];
            let value = args.get(i + 1).cloned();
            let mut takes_value = true;
            match arg.as_str() {
                "--network" | "-n" => opts.network = value,
                "--url" | "-u" => opts.url = value,
                "--proxy" => opts.proxy = value,
                "--mnemonic" | "-m" => opts.mnemonic = value,
                "--passphrase" => opts.passphrase = value,
                "--data-dir" | "-d" => opts.data_dir = value,
                "--chain" | "-c" => opts.chain = value,
                "--index" | "-i" => opts.index = value.and_then(|v| v.parse().ok()),
                "--accounts" => opts.accounts = value.and_then(|v| v.parse().ok()),
                "--subaccount" | "-s" => opts.subaccount = value.and_then(|v| v.parse().ok()).unwrap_or(0),
                "--confs" => opts.confs = value.and_then(|v| v.parse().ok()).unwrap_or(0),
                "--offset" => opts.offset = value.and_then(|v| v.parse().ok()).unwrap_or(0),
                "--count" => opts.count = value.and_then(|v| v.parse().ok()),
                "--log-level" => {
                    opts.log_level = match value.as_deref() {
                        Some("debug") => LogLevel::Debug,
                        Some("warn") => LogLevel::Warn,
                        Some("error") => LogLevel::Error,
                        _ => LogLevel::Info,
                    }
                }
                _ => {
                    takes_value = false;
                    match arg.as_str() {
                        "--help" | "-h" => opts.help = true,
                        "--version" | "-V" => opts.version = true,
                        "--pretty" => opts.pretty = true,
                        "--tls" => opts.tls = Some(true),
                        "--no-tls" => opts.tls = Some(false),
                        "--noverify" => opts.noverify = true,
                        "--tor" => opts.tor = true,
                        _ if !arg.starts_with('-') => positional.push(arg.clone()),
                        _ => {} // Ignore unknown flags
                    }
                }
            }
            i += if takes_value { 2 } else { 1 };
        }

        if !positional.is_empty() {
            opts.command = Some(positional.remove(0));
        }

        // Environment variables (lower priority than CLI args)
        let from_env = |key: &str| env::var(key).ok().filter(|s| !s.is_empty());
        opts.mnemonic = opts.mnemonic.or_else(|| from_env("SESSION_MNEMONIC"));
        opts.passphrase = opts.passphrase.or_else(|| from_env("SESSION_PASSPHRASE"));
        opts.network = opts.network.or_else(|| from_env("SESSION_NETWORK"));
        opts.url = opts.url.or_else(|| from_env("SESSION_URL"));
        opts.data_dir = opts.data_dir.or_else(|| from_env("SESSION_DATADIR"));
        if opts.tls.is_none() {
            opts.tls = from_env("SESSION_TLS").map(|v| matches!(v.as_str(), "1" | "true" | "yes"));
        }
        opts
    }

    fn parameters(&self) -> NetworkParameters {
        let mut params = NetworkParameters::new(self.network.as_deref().unwrap_or("testnet"))
            .with_tor(self.tor)
            .with_domain_validation(!self.noverify)
            .with_log_level(self.log_level);
        if let Some(url) = &self.url {
            params = params.with_url(url);
        }
        if let Some(tls) = self.tls {
            params = params.with_tls(tls);
        }
        if let Some(proxy) = &self.proxy {
            params = params.with_proxy(proxy);
        }
        params
    }

    fn config(&self) -> SessionConfig {
        let config = match &self.data_dir {
            Some(dir) => SessionConfig::default().with_data_dir(dir),
            None => SessionConfig::default().with_default_data_dir(),
        };
        // The selected subaccount must be loaded.
        let accounts = self.accounts.unwrap_or(1).max(self.subaccount.saturating_add(1));
        config.with_accounts(accounts)
    }

    fn chain(&self) -> Result<ChainType> {
        match self.chain.as_deref() {
            None | Some("external") | Some("receive") => Ok(ChainType::External),
            Some("internal") | Some("change") => Ok(ChainType::Internal),
            Some(other) => Err(anyhow!("unknown chain type: {}", other)),
        }
    }
}

async fn run(opts: &ParsedArgs) -> Result<Value> {
    let session = Session::new(opts.config());
    session.connect(opts.parameters()).await.context("connect")?;
    let mnemonic = opts.mnemonic.as_deref().unwrap_or(TEST_MNEMONIC);
    session
        .login(mnemonic, opts.passphrase.as_deref().unwrap_or(""))
        .await
        .context("login")?;

    let output = match opts.command.as_deref().unwrap_or("smoke") {
        "smoke" => cmd_smoke(&session).await,
        "address" => {
            let options = ReceiveAddressOptions { subaccount: opts.subaccount, chain_type: opts.chain()?, index: opts.index };
            Ok(serde_json::to_value(session.get_receive_address(options).await?)?)
        }
        "balance" => {
            let options = BalanceOptions::with_num_confs(opts.confs).for_subaccount(opts.subaccount);
            Ok(serde_json::to_value(session.get_balance(options).await?)?)
        }
        "utxos" => {
            let options = BalanceOptions::with_num_confs(opts.confs).for_subaccount(opts.subaccount);
            let utxos = session.get_unspent_outputs(options).await?;
            Ok(serde_json::to_value(utxos)?)
        }
        "transactions" | "txs" => {
            let mut options = TransactionsOptions::default().for_subaccount(opts.subaccount);
            options.offset = opts.offset;
            if let Some(count) = opts.count {
                options.count = count;
            }
            Ok(serde_json::to_value(session.get_transactions(options).await?)?)
        }
        "fees" => Ok(serde_json::to_value(session.get_fee_estimates().await?)?),
        "subaccounts" => Ok(serde_json::to_value(session.get_subaccounts().await?)?),
        other => Err(anyhow!("unknown command: {}", other)),
    };

    session.disconnect().await;
    output
}

/// Two fresh addresses differ, history lists, balance and fees are sane.
async fn cmd_smoke(session: &Session) -> Result<Value> {
    let first = session.get_receive_address(ReceiveAddressOptions::default()).await?;
    let second = session.get_receive_address(ReceiveAddressOptions::default()).await?;
    if first.address == second.address {
        bail!("receive address reused: {}", first.address);
    }
    info!("Receive addresses {} / {}", first.address, second.address);

    let transactions = session.get_transactions(TransactionsOptions::page(0, 10)).await?;

    let balance = session.get_balance(BalanceOptions::default()).await?;
    info!("Balance {} sat", balance.btc());

    let fees = session.get_fee_estimates().await?;
    if fees.fees.is_empty() {
        bail!("empty fee estimates");
    }

    Ok(json!({
        "ok": true,
        "addresses": [first.address, second.address],
        "transactions": transactions.len(),
        "balance": balance,
        "fees": fees.fees,
    }))
}

fn print_usage() {
    println!(
        r#"electrum-session - wallet session smoke harness

USAGE:
    electrum-session [COMMAND] [OPTIONS]

COMMANDS:
    smoke           Distinct addresses, history, balance and fees (default)
    address         Next receive address (--chain, --index to peek)
    balance         Balance in satoshis (--confs N)
    utxos           Unspent outputs (--confs N)
    transactions    Transaction history (--offset N --count N)
    fees            Fee estimates, sat/kvB, 25 buckets
    subaccounts     Account numbers loaded at login

OPTIONS:
    -n, --network <name>     mainnet | testnet | signet | regtest [default: testnet]
    -u, --url <url>          Electrum server, host:port[:t|s[:noverify]]
        --tls / --no-tls     Override the protocol
        --noverify           Skip certificate domain validation (insecure)
        --tor                Connect through SOCKS5 (--proxy <addr>)
    -m, --mnemonic <words>   Wallet mnemonic [default: BIP39 test vector]
        --passphrase <text>  BIP39 passphrase
    -d, --data-dir <dir>     Persisted wallet state
        --accounts <n>       Load BIP84 accounts 0..n [default: 1]
    -s, --subaccount <n>     Account to query [default: 0]
        --log-level <level>  debug | info | warn | error
        --pretty             Pretty-print JSON
    -h, --help               Show this help
    -V, --version            Show version

ENVIRONMENT:
    SESSION_MNEMONIC, SESSION_PASSPHRASE, SESSION_NETWORK, SESSION_URL,
    SESSION_TLS, SESSION_DATADIR, RUST_LOG, ELECTRUM_SESSION_LOG_JSON=1"#
    );
}
