use std::io::{self, BufRead, Write};
use std::process;
use std::sync::Arc;

use quiver::{
    AggregateSpec, BoundPlan, Config, Connection, Database, LogicalType, QueryResult, QuiverError,
    Result, Value,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_usage() {
    eprintln!("quiver {VERSION} - embedded property-graph database");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    quiver <command> [args]");
    eprintln!();
    eprintln!("COMMANDS:");
    eprintln!("    shell <dir>      Open a statement shell on the database");
    eprintln!("    inspect <dir>    Print catalog and statistics summaries");
    eprintln!("    verify <dir>     Run the structural integrity check");
    eprintln!("    version          Show version information");
    eprintln!("    help             Show this help message");
    eprintln!();
}

fn print_shell_usage() {
    println!("statements:");
    println!("    create-node-table <name> <prop:TYPE,...> <pk>");
    println!("    create-rel-table <name> <src> <dst> [prop:TYPE,...]");
    println!("    insert-node <table> <value,...>");
    println!("    insert-rel <table> <src-key> <dst-key> [value,...]");
    println!("    count-nodes <table>");
    println!("    count-rels <table> (counts fwd adjacency rows)");
    println!("    begin-read | begin-write | commit | rollback");
    println!("    checkpoint | verify | tables | help | quit");
    println!();
    println!("types: INT64, DOUBLE, STRING, BOOL");
    println!("values: integers, floats, 'quoted strings', true/false, null");
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = match args.first().map(String::as_str) {
        Some("shell") => with_database(args.get(1), run_shell),
        Some("inspect") => with_database(args.get(1), run_inspect),
        Some("verify") => with_database(args.get(1), |db| db.verify()),
        Some("version") => {
            println!("quiver {VERSION}");
            0
        }
        Some("help") | None => {
            print_usage();
            if args.is_empty() {
                1
            } else {
                0
            }
        }
        Some(other) => {
            eprintln!("unknown command: {other}");
            print_usage();
            1
        }
    };
    process::exit(code);
}

fn with_database(path: Option<&String>, run: impl FnOnce(&Arc<Database>) -> Result<()>) -> i32 {
    let Some(path) = path else {
        eprintln!("missing database directory");
        print_usage();
        return 1;
    };
    let db = match Database::open_with_config(path, Config::default()) {
        Ok(db) => db,
        Err(err) => {
            eprintln!("cannot open {path}: {err}");
            return 1;
        }
    };
    match run(&db) {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("error: {err}");
            1
        }
    }
}

fn run_inspect(db: &Arc<Database>) -> Result<()> {
    let catalog = db
        .catalog()
        .snapshot(quiver::transaction::TransactionKind::ReadOnly);
    println!("node tables:");
    for def in &catalog.node_tables {
        let count = db.statistics().num_nodes(
            def.id,
            quiver::transaction::TransactionKind::ReadOnly,
        );
        let properties: Vec<String> = def
            .properties
            .iter()
            .map(|p| format!("{}:{}", p.name, p.ty))
            .collect();
        println!("    {} ({}) - {} nodes", def.name, properties.join(", "), count);
    }
    println!("rel tables:");
    for def in &catalog.rel_tables {
        let count = db.statistics().num_rels(
            def.id,
            quiver::transaction::TransactionKind::ReadOnly,
        );
        println!("    {} - {} rels", def.name, count);
    }
    Ok(())
}

fn run_shell(db: &Arc<Database>) -> Result<()> {
    let conn = db.connect();
    let stdin = io::stdin();
    let mut out = io::stdout();
    print!("> ");
    out.flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            match run_statement(db, &conn, line) {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => {
                    if err.is_fatal() {
                        return Err(err);
                    }
                    eprintln!("error: {err}");
                }
            }
        }
        print!("> ");
        out.flush()?;
    }
    Ok(())
}

/// Runs one statement; returns false on `quit`.
fn run_statement(db: &Arc<Database>, conn: &Connection, line: &str) -> Result<bool> {
    let words = tokenize(line)?;
    let Some((command, rest)) = words.split_first() else {
        return Ok(true);
    };
    match command.as_str() {
        "quit" | "exit" => return Ok(false),
        "help" => print_shell_usage(),
        "tables" => run_inspect(db)?,
        "checkpoint" => {
            db.checkpoint()?;
            println!("ok");
        }
        "verify" => {
            db.verify()?;
            println!("ok");
        }
        "begin-read" => conn.begin_read()?,
        "begin-write" => conn.begin_write()?,
        "commit" => conn.commit()?,
        "rollback" => conn.rollback()?,
        "create-node-table" => {
            let [name, props, pk] = rest else {
                return Err(QuiverError::Binder(
                    "usage: create-node-table <name> <prop:TYPE,...> <pk>".into(),
                ));
            };
            let properties = parse_properties(props)?;
            let refs: Vec<(&str, LogicalType)> = properties
                .iter()
                .map(|(n, t)| (n.as_str(), t.clone()))
                .collect();
            conn.create_node_table(name, &refs, pk)?;
            println!("ok");
        }
        "create-rel-table" => {
            let (name, src, dst, props) = match rest {
                [name, src, dst] => (name, src, dst, None),
                [name, src, dst, props] => (name, src, dst, Some(props)),
                _ => {
                    return Err(QuiverError::Binder(
                        "usage: create-rel-table <name> <src> <dst> [prop:TYPE,...]".into(),
                    ))
                }
            };
            let properties = props.map(|p| parse_properties(p)).transpose()?.unwrap_or_default();
            let refs: Vec<(&str, LogicalType)> = properties
                .iter()
                .map(|(n, t)| (n.as_str(), t.clone()))
                .collect();
            conn.create_rel_table(name, src, dst, &refs)?;
            println!("ok");
        }
        "insert-node" => {
            let [table, values] = rest else {
                return Err(QuiverError::Binder(
                    "usage: insert-node <table> <value,...>".into(),
                ));
            };
            let values = parse_values(values)?;
            let offset = conn.insert_node(table, &values)?;
            println!("inserted node at offset {offset}");
        }
        "insert-rel" => {
            let (table, src, dst, values) = match rest {
                [table, src, dst] => (table, src, dst, Vec::new()),
                [table, src, dst, values] => (table, src, dst, parse_values(values)?),
                _ => {
                    return Err(QuiverError::Binder(
                        "usage: insert-rel <table> <src-key> <dst-key> [value,...]".into(),
                    ))
                }
            };
            let offset = conn.insert_rel(table, &parse_value(src)?, &parse_value(dst)?, &values)?;
            println!("inserted rel at offset {offset}");
        }
        "count-nodes" => {
            let [table] = rest else {
                return Err(QuiverError::Binder("usage: count-nodes <table>".into()));
            };
            let id = resolve_node_table(db, table)?;
            let plan = BoundPlan::ScanNodes {
                table: id,
                columns: vec![],
            }
            .aggregate(vec![], vec![AggregateSpec::CountStar]);
            print_result(&conn.execute(&plan)?);
        }
        "count-rels" => {
            let [table] = rest else {
                return Err(QuiverError::Binder("usage: count-rels <table>".into()));
            };
            let catalog = db
                .catalog()
                .snapshot(quiver::transaction::TransactionKind::ReadOnly);
            let def = catalog
                .rel_table(table)
                .ok_or_else(|| QuiverError::Binder(format!("unknown rel table {table}")))?;
            let plan = BoundPlan::Expand {
                child: Box::new(BoundPlan::ScanNodes {
                    table: def.src_table,
                    columns: vec![],
                }),
                from_column: 0,
                rel_table: def.id,
                direction: quiver::Direction::Fwd,
            }
            .aggregate(vec![], vec![AggregateSpec::CountStar]);
            print_result(&conn.execute(&plan)?);
        }
        other => {
            return Err(QuiverError::Binder(format!(
                "unknown statement: {other} (try 'help')"
            )));
        }
    }
    Ok(true)
}

fn resolve_node_table(db: &Arc<Database>, name: &str) -> Result<quiver::TableId> {
    let catalog = db
        .catalog()
        .snapshot(quiver::transaction::TransactionKind::ReadOnly);
    Ok(catalog
        .node_table(name)
        .ok_or_else(|| QuiverError::Binder(format!("unknown node table {name}")))?
        .id)
}

fn print_result(result: &QueryResult) {
    for row in &result.rows {
        let cells: Vec<String> = row.iter().map(|v| v.to_string()).collect();
        println!("{}", cells.join(" | "));
    }
    println!("({} rows)", result.num_rows());
}

/// Splits on whitespace outside single quotes.
fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '\'' => {
                quoted = !quoted;
                current.push(c);
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if quoted {
        return Err(QuiverError::Binder("unterminated string literal".into()));
    }
    if !current.is_empty() {
        words.push(current);
    }
    Ok(words)
}

fn parse_properties(spec: &str) -> Result<Vec<(String, LogicalType)>> {
    spec.split(',')
        .map(|pair| {
            let (name, ty) = pair.split_once(':').ok_or_else(|| {
                QuiverError::Binder(format!("expected prop:TYPE, found '{pair}'"))
            })?;
            let ty = match ty.to_ascii_uppercase().as_str() {
                "INT64" => LogicalType::Int64,
                "DOUBLE" => LogicalType::Float64,
                "STRING" => LogicalType::String,
                "BOOL" => LogicalType::Bool,
                other => {
                    return Err(QuiverError::Binder(format!("unknown type {other}")));
                }
            };
            Ok((name.to_string(), ty))
        })
        .collect()
}

fn parse_values(spec: &str) -> Result<Vec<Value>> {
    split_values(spec).iter().map(|v| parse_value(v)).collect()
}

/// Splits a comma list, keeping commas inside quotes.
fn split_values(spec: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in spec.chars() {
        match c {
            '\'' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => out.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    out.push(current);
    out
}

fn parse_value(word: &str) -> Result<Value> {
    let word = word.trim();
    if word.eq_ignore_ascii_case("null") {
        return Ok(Value::Null);
    }
    if word.eq_ignore_ascii_case("true") {
        return Ok(Value::Bool(true));
    }
    if word.eq_ignore_ascii_case("false") {
        return Ok(Value::Bool(false));
    }
    if let Some(inner) = word.strip_prefix('\'').and_then(|w| w.strip_suffix('\'')) {
        return Ok(Value::String(inner.to_string()));
    }
    if let Ok(v) = word.parse::<i64>() {
        return Ok(Value::Int64(v));
    }
    if let Ok(v) = word.parse::<f64>() {
        return Ok(Value::Float64(v));
    }
    Err(QuiverError::Binder(format!("cannot parse value '{word}'")))
}
