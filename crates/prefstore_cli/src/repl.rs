//! Line-oriented interactive session.

use futures::StreamExt;
use prefstore_core::{ExclusiveRepository, PreferencesRepository, PreferencesService};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

type Service = PreferencesService<ExclusiveRepository>;

const DEFAULT_INCREMENT_DELAY: Duration = Duration::from_secs(5);

const HELP: &str = "commands: get | set N | reset | stage | commit | increment [MS] | show | help | quit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplCommand {
    Get,
    Set(u32),
    Reset,
    Stage,
    Commit,
    Increment(Duration),
    Show,
    Help,
    Quit,
}

/// `Ok(None)` for blank lines.
fn parse_command(line: &str) -> Result<Option<ReplCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Ok(None);
    };
    let argument = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments for `{name}`"));
    }

    let command = match (name, argument) {
        ("get", None) => ReplCommand::Get,
        ("set", Some(counter)) => ReplCommand::Set(
            counter
                .parse()
                .map_err(|_| format!("`{counter}` is not a valid counter"))?,
        ),
        ("set", None) => return Err("`set` needs a counter".to_string()),
        ("reset", None) => ReplCommand::Reset,
        ("stage", None) => ReplCommand::Stage,
        ("commit", None) => ReplCommand::Commit,
        ("increment", None) => ReplCommand::Increment(DEFAULT_INCREMENT_DELAY),
        ("increment", Some(millis)) => ReplCommand::Increment(Duration::from_millis(
            millis
                .parse()
                .map_err(|_| format!("`{millis}` is not a delay in milliseconds"))?,
        )),
        ("show", None) => ReplCommand::Show,
        ("help", None) => ReplCommand::Help,
        ("quit" | "exit", None) => ReplCommand::Quit,
        (other, _) => return Err(format!("unknown command `{other}`; try `help`")),
    };
    Ok(Some(command))
}

pub async fn run(service: Arc<Service>) -> io::Result<()> {
    let mut updates = service.repository().load();
    let printer = tokio::spawn(async move {
        while let Some(item) = updates.next().await {
            match item {
                Ok(value) => println!("update counter={}", value.counter),
                Err(err) => println!("update error={err}"),
            }
        }
    });

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Ok(Some(ReplCommand::Quit)) => break,
            Ok(Some(command)) => execute(&service, command).await,
            Ok(None) => {}
            Err(message) => println!("error: {message}"),
        }
    }

    printer.abort();
    Ok(())
}

async fn execute(service: &Arc<Service>, command: ReplCommand) {
    match command {
        ReplCommand::Get => match service.get_current().await {
            Ok(value) => println!("counter={}", value.counter),
            Err(err) => println!("error: {err}"),
        },
        ReplCommand::Set(counter) => {
            if let Err(err) = service.set_counter(counter).await {
                println!("error: {err}");
            }
        }
        ReplCommand::Reset => {
            if let Err(err) = service.reset().await {
                println!("error: {err}");
            }
        }
        ReplCommand::Stage => match service.stage_increment().await {
            Ok(value) => println!("staged={}", value.counter),
            Err(err) => println!("error: {err}"),
        },
        ReplCommand::Commit => match service.commit_staged().await {
            Ok(value) => println!("committed={}", value.counter),
            Err(err) => println!("error: {err}"),
        },
        ReplCommand::Increment(delay) => {
            // Runs in the background so several increments can overlap.
            let service = Arc::clone(service);
            println!("increment started delay_ms={}", delay.as_millis());
            tokio::spawn(async move {
                match service.increment_in_transaction(delay).await {
                    Ok(value) => println!("increment committed counter={}", value.counter),
                    Err(err) => println!("increment failed error={err}"),
                }
            });
        }
        ReplCommand::Show => {
            let current = *service.current().borrow();
            let staged = *service.staged().borrow();
            println!("current={} staged={}", current.counter, staged.counter);
        }
        ReplCommand::Help => println!("{HELP}"),
        ReplCommand::Quit => {}
    }
}
