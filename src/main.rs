use std::env;
use std::fs;
use std::process;

use snakec::{CompileOptions, Width, compile};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: snakec <source> [--arch 32|64] [--template <file>]";

#[derive(Debug)]
struct Args {
  source: String,
  width: Width,
  template: Option<String>,
}

fn parse_args(args: &[String]) -> Result<Args, String> {
  let mut source = None;
  let mut width = Width::default();
  let mut template = None;

  let mut iter = args.iter();
  while let Some(arg) = iter.next() {
    match arg.as_str() {
      "--arch" => {
        let value = iter.next().ok_or("--arch needs a value")?;
        width = value.parse::<Width>().map_err(|err| err.to_string())?;
      }
      "--template" => {
        template = Some(iter.next().ok_or("--template needs a path")?.clone());
      }
      flag if flag.starts_with("--") => return Err(format!("unknown option {flag}")),
      path if source.is_none() => source = Some(path.to_string()),
      extra => return Err(format!("unexpected argument {extra}")),
    }
  }

  let source = source.ok_or("missing source file")?;
  Ok(Args {
    source,
    width,
    template,
  })
}

fn read(path: &str) -> String {
  fs::read_to_string(path).unwrap_or_else(|err| {
    eprintln!("cannot read {path}: {err}");
    process::exit(1);
  })
}

fn main() {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_target(false)
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
    .init();

  let raw: Vec<String> = env::args().skip(1).collect();
  let args = parse_args(&raw).unwrap_or_else(|err| {
    eprintln!("{err}\n{USAGE}");
    process::exit(1);
  });

  let source = read(&args.source);
  tracing::info!(source = %args.source, width = %args.width, "compiling");

  match compile(&source, CompileOptions::with_width(args.width)) {
    Ok(output) => match &args.template {
      Some(path) => print!("{}", output.embed(&read(path))),
      None => println!("{}", output.assembly_text()),
    },
    Err(err) => {
      eprintln!("{}", err.render(&source));
      process::exit(1);
    }
  }
}
