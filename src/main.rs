//! Formyx demo - drive a form engine from a line-oriented terminal session
//!
//! Reads commands from stdin and prints the form snapshot after each one:
//!
//! ```text
//! change <field> <json value>
//! blur <field>
//! submit
//! reset
//! show
//! quit
//! ```

use anyhow::{bail, Context, Result};
use formyx::{
    CustomCheck, FieldDefinition, FieldOption, FieldValue, FnSubmit, FormConfig, FormData,
    FormEngine, FormError, FormSchema, InputKind, Strategy, SubmitOutcome, ValidationRule,
    Verdict,
};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "formyx=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let schema = load_schema(std::env::args().nth(1).map(PathBuf::from))?;
    let config = FormConfig::new(schema)
        .with_submit_handler(Arc::new(FnSubmit::new(|values: FormData| async move {
            info!(fields = values.len(), "received submission");
            Ok::<_, anyhow::Error>(())
        })));
    let config = if config.schema.field("username").is_some() {
        config.with_check("username", username_check())?
    } else {
        config
    };
    let mut engine = FormEngine::new(config)?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let command = match Command::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(err) => {
                eprintln!("Error: {err}");
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        if let Err(err) = run_command(&mut engine, command).await {
            eprintln!("Error: {err:?}");
        }
        engine.settle().await;
        println!("{}", serde_json::to_string_pretty(&engine.snapshot())?);
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Change(String, FieldValue),
    Blur(String),
    Submit,
    Reset,
    Show,
    Quit,
}

impl Command {
    /// Parse one input line; blank lines yield `None`
    fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let command = match verb {
            "change" => {
                let (field, raw) = rest
                    .split_once(char::is_whitespace)
                    .context("usage: change <field> <json value>")?;
                let value: FieldValue = serde_json::from_str(raw.trim())
                    .with_context(|| format!("`{}` is not a JSON value", raw.trim()))?;
                Command::Change(field.to_string(), value)
            }
            "blur" if !rest.is_empty() => Command::Blur(rest.to_string()),
            "blur" => bail!("usage: blur <field>"),
            "submit" => Command::Submit,
            "reset" => Command::Reset,
            "show" => Command::Show,
            "quit" | "exit" => Command::Quit,
            other => bail!("unknown command `{other}`"),
        };
        Ok(Some(command))
    }
}

async fn run_command(engine: &mut FormEngine, command: Command) -> Result<()> {
    match command {
        Command::Change(field, value) => engine.change(&field, value),
        Command::Blur(field) => engine.blur(&field),
        Command::Submit => match engine.submit().await {
            Ok(SubmitOutcome::Submitted) => info!("submitted"),
            Ok(SubmitOutcome::Invalid(errors)) => {
                warn!(errors = errors.len(), "form has errors");
            }
            Err(FormError::Submit(err)) => return Err(err.context("submission failed")),
            Err(err) => return Err(err.into()),
        },
        Command::Reset => engine.reset(None),
        Command::Show | Command::Quit => {}
    }
    Ok(())
}

/// Schema from the given path, else from the default location, else the
/// built-in registration form
fn load_schema(path: Option<PathBuf>) -> Result<FormSchema> {
    if let Some(path) = path {
        return FormSchema::load(&path)
            .with_context(|| format!("failed to load schema from {}", path.display()));
    }
    match FormSchema::load_default()? {
        Some(schema) => Ok(schema),
        None => Ok(demo_schema()?),
    }
}

fn demo_schema() -> Result<FormSchema, FormError> {
    Ok(FormSchema {
        fields: vec![
            FieldDefinition::new("username")
                .label("Username")
                .required()
                .rule(ValidationRule::new().min_length(3))
                .timing(Strategy::debounce(Duration::from_millis(300))),
            FieldDefinition::new("email")
                .label("Email")
                .kind(InputKind::Email)
                .required()
                .rule(ValidationRule::new().pattern(r"\S+@\S+\.\S+")?),
            FieldDefinition::new("password")
                .label("Password")
                .kind(InputKind::Password)
                .required()
                .rule(ValidationRule::new().min_length(6)),
            FieldDefinition::new("age")
                .label("Age")
                .kind(InputKind::Number)
                .rule(
                    ValidationRule::new()
                        .min(18i64)
                        .max(100i64)
                        .message("Age must be between 18 and 100"),
                ),
            FieldDefinition::new("bio")
                .label("Bio")
                .kind(InputKind::Textarea),
            FieldDefinition::new("country")
                .label("Country")
                .kind(InputKind::Select)
                .rule(ValidationRule::new().required_with("Please select a country"))
                .options(vec![
                    FieldOption::new("United States", "us"),
                    FieldOption::new("Canada", "ca"),
                    FieldOption::new("United Kingdom", "uk"),
                    FieldOption::new("Australia", "au"),
                ]),
            FieldDefinition::new("gender")
                .label("Gender")
                .kind(InputKind::Radio)
                .options(vec![
                    FieldOption::new("Male", "male"),
                    FieldOption::new("Female", "female"),
                    FieldOption::new("Other", "other"),
                ]),
            FieldDefinition::new("subscribe")
                .label("Subscribe to newsletter")
                .kind(InputKind::Checkbox),
            FieldDefinition::new("avatar")
                .label("Avatar")
                .kind(InputKind::File),
        ],
        ..Default::default()
    })
}

/// Pretend availability lookup for usernames
fn username_check() -> CustomCheck {
    CustomCheck::future(|value: FieldValue, _form: FormData| async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let taken = matches!(value.as_text(), Some("admin" | "root"));
        Ok::<_, anyhow::Error>(if taken {
            Verdict::from("Username is already taken")
        } else {
            Verdict::Pass
        })
    })
}
