use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::env;
use std::path::Path;

use payref::{
    apply_report, create_payment_request, find_by_reference, format_amount, get_payment_request,
    list_payment_requests, load_statement_csv, parse, parse_amount_cents, setup_database,
    update_status, Config, EpcPayload, NewPaymentRequest, PaymentStatus, ReconciliationEngine,
};

const USAGE: &str = "\
Usage: payref <command> [args]

Commands:
  init                                  create the database
  generate <sequence>                   print the reference for a sequence number
  validate <reference>                  check a reference and show its sequence number
  create <recipient> <amount> [message] issue a payment request (amount like 125.50)
  list                                  list payment requests
  status <id> <PENDING|PAID|CANCELLED>  change a request's status
  qr <id>                               print the EPC QR payload for a request
  reconcile <statement.csv>             match a bank statement against open requests";

fn main() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let config = Config::load()?;
    payref::logging::init(&config.log_level);

    match args.first().map(String::as_str) {
        Some("generate") => run_generate(&args[1..]),
        Some("validate") => run_validate(&args[1..]),
        Some("init") => run_init(&config),
        Some("create") => run_create(&config, &args[1..]),
        Some("list") => run_list(&config),
        Some("status") => run_status(&config, &args[1..]),
        Some("qr") => run_qr(&config, &args[1..]),
        Some("reconcile") => run_reconcile(&config, &args[1..]),
        _ => {
            println!("{}", USAGE);
            Ok(())
        }
    }
}

fn open_database(config: &Config) -> Result<Connection> {
    let conn = Connection::open(&config.database_path)
        .with_context(|| format!("Failed to open database {:?}", config.database_path))?;
    setup_database(&conn)?;
    Ok(conn)
}

fn arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    match args.get(index) {
        Some(value) => Ok(value.as_str()),
        None => bail!("missing <{}>\n\n{}", name, USAGE),
    }
}

fn run_generate(args: &[String]) -> Result<()> {
    let sequence: u64 = arg(args, 0, "sequence")?
        .parse()
        .context("sequence must be a non-negative integer")?;

    let reference = payref::generate(sequence)?;
    println!("{}", reference);

    Ok(())
}

fn run_validate(args: &[String]) -> Result<()> {
    let candidate = arg(args, 0, "reference")?;

    match parse(candidate) {
        Ok(reference) => {
            println!("✓ valid: {} (sequence {})", reference, reference.sequence_number());
            Ok(())
        }
        Err(err) => bail!("✗ invalid reference {:?}: {}", candidate, err),
    }
}

fn run_init(config: &Config) -> Result<()> {
    open_database(config)?;
    println!("✓ Database ready at {:?}", config.database_path);
    Ok(())
}

fn run_create(config: &Config, args: &[String]) -> Result<()> {
    let recipient = arg(args, 0, "recipient")?;
    let amount_cents = parse_amount_cents(arg(args, 1, "amount")?)?;
    let message = args.get(2).map(String::as_str);

    let conn = open_database(config)?;
    let new = NewPaymentRequest::new(recipient, amount_cents, message);
    let request = create_payment_request(&conn, &new)?;

    println!("✓ Payment request {}", request.id);
    println!("  Reference: {}", request.reference);
    println!("  Amount:    EUR {}", request.display_amount());

    Ok(())
}

fn run_list(config: &Config) -> Result<()> {
    let conn = open_database(config)?;
    let requests = list_payment_requests(&conn)?;

    if requests.is_empty() {
        println!("No payment requests yet.");
        return Ok(());
    }

    for request in &requests {
        println!(
            "{}  {}  {:>12}  {:<9}  {}",
            request.id,
            request.reference,
            format_amount(request.amount_cents),
            request.status,
            request.recipient
        );
    }
    println!("\n{} payment requests", requests.len());

    Ok(())
}

fn run_status(config: &Config, args: &[String]) -> Result<()> {
    let id = arg(args, 0, "id")?;
    let status: PaymentStatus = arg(args, 1, "status")?.parse()?;

    let conn = open_database(config)?;
    let request = update_status(&conn, id, status, "cli")?;

    println!("✓ {} is now {}", request.reference, request.status);
    Ok(())
}

fn run_qr(config: &Config, args: &[String]) -> Result<()> {
    let id = arg(args, 0, "id")?;
    let conn = open_database(config)?;

    // Accept either the request id or its structured reference
    let request = match get_payment_request(&conn, id)? {
        Some(request) => Some(request),
        None => match parse(id) {
            Ok(reference) => find_by_reference(&conn, &reference)?,
            Err(_) => None,
        },
    };
    let Some(request) = request else {
        bail!("payment request not found: {}", id);
    };

    let payload = EpcPayload::for_request(&config.creditor, &request).encode()?;
    println!("{}", payload);

    Ok(())
}

fn run_reconcile(config: &Config, args: &[String]) -> Result<()> {
    let path = arg(args, 0, "statement.csv")?;
    let lines = load_statement_csv(Path::new(path))?;
    println!("📂 Loaded {} statement lines", lines.len());

    let conn = open_database(config)?;
    let requests = list_payment_requests(&conn)?;

    let engine = ReconciliationEngine::with_tolerance_cents(config.amount_tolerance_cents);
    let report = engine.reconcile(&lines, &requests);
    let applied = apply_report(&conn, &report)?;

    println!("{}", report.summary());
    println!(
        "✓ Imported {} lines, skipped {} seen before, marked {} paid",
        applied.imported, applied.duplicates, applied.marked_paid
    );
    if applied.settled_elsewhere > 0 {
        println!(
            "  ⚠️  {} matched requests were closed before import, lines stored unmatched",
            applied.settled_elsewhere
        );
    }

    for line in report.unreconciled() {
        println!(
            "  ⚠️  {}  EUR {:>10}  {:<30}  {:?}",
            line.line.date,
            format_amount(line.line.amount_cents),
            line.line.communication,
            line.outcome
        );
    }

    Ok(())
}
