use std::path::PathBuf;

use owlchat::RunOptions;

const USAGE: &str = "owlchat - threaded workspace chat on an OwlDB store.\n\nUsage: owlchat [--config <file>] <workspace> <channel>\n\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message\n  --demo               Run a scripted session against an in-memory store\n  --config <file>      Read configuration from <file>";

enum Command {
    Exit,
    Demo,
    Follow(RunOptions),
}

fn main() {
    let command = match parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("error: {message}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    owlchat::app::init_tracing();
    let result = match command {
        Command::Exit => return,
        Command::Demo => owlchat::run_demo(),
        Command::Follow(options) => owlchat::run(options),
    };
    if let Err(err) = result {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Command, String> {
    let mut positional = Vec::new();
    let mut config_file = None;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("owlchat {}", owlchat::VERSION);
                return Ok(Command::Exit);
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(Command::Exit);
            }
            "--demo" => return Ok(Command::Demo),
            "--config" => {
                let path = args.next().ok_or("--config needs a file")?;
                config_file = Some(PathBuf::from(path));
            }
            other if other.starts_with('-') => return Err(format!("unknown flag {other}")),
            _ => positional.push(arg),
        }
    }

    match <[String; 2]>::try_from(positional) {
        Ok([workspace, channel]) => Ok(Command::Follow(RunOptions {
            config_file,
            workspace,
            channel,
        })),
        Err(_) => Err("expected <workspace> <channel>".into()),
    }
}
