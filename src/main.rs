use std::io::Write;

use clap::CommandFactory;
use eyre::{Context, Result};
use palaver::backend::new_registry;
use palaver::cli::{Action, Command};
use palaver::config::init_logger;
use palaver::engine::{Engine, ResponseStream, is_error_fragment};
use palaver::models::{EngineError, FilterSession};
use palaver::retrieval::new_retriever;
use palaver::storage::new_storage;
use serde::Serialize;

#[tokio::main]
async fn main() -> Result<()> {
    let cmd = Command::new();
    if cmd.version() {
        cmd.print_version();
        return Ok(());
    }

    let Some(action) = cmd.action().cloned() else {
        Command::command().print_help()?;
        return Ok(());
    };

    std::panic::set_hook(Box::new(|panic_info| {
        better_panic::Settings::auto().create_panic_handler()(panic_info);
    }));

    let config = cmd.get_config()?;
    init_logger(&config.log).wrap_err("initializing logger")?;

    let backend = new_registry(&config.backend).wrap_err("initializing backend")?;
    let storage = new_storage(&config.storage)
        .await
        .wrap_err("initializing storage")?;
    let retriever = new_retriever(&config.retrieval).wrap_err("initializing retrieval")?;
    let engine = Engine::new(&config, backend, storage, retriever);

    if let Err(err) = run(&engine, cmd.owner(), action).await {
        log::error!("Request failed: {}", err);
        eprintln!("{}", serde_json::to_string_pretty(&err.body())?);
        std::process::exit(1);
    }
    Ok(())
}

async fn run(engine: &Engine, owner: &str, action: Action) -> Result<(), EngineError> {
    match action {
        Action::Models => print_json(&engine.list_models()),
        Action::Sessions { title, contains } => {
            let mut filter = FilterSession::default();
            if let Some(title) = title {
                filter = filter.with_title(title);
            }
            if let Some(contains) = contains {
                filter = filter.with_message_contains(contains);
            }
            print_json(&engine.search_sessions(owner, filter).await?)
        }
        Action::New => print_json(&engine.create_session(owner).await?),
        Action::Show { session_id } => {
            let session = engine.get_session(&session_id, owner).await?;
            let messages = engine.list_messages(&session_id, owner).await?;
            let state = engine.session_state(&session_id, owner).await?;
            print_json(&serde_json::json!({
                "session": session,
                "state": state,
                "messages": messages,
            }))
        }
        Action::Send {
            session_id,
            content,
            model,
        } => {
            let stream = engine
                .append_message(&session_id, owner, &content, &model)
                .await?;
            follow(stream).await
        }
        Action::Edit {
            session_id,
            message_idx,
            content,
            model,
        } => {
            let stream = engine
                .edit_last_message(&session_id, owner, message_idx, &content, &model)
                .await?;
            follow(stream).await
        }
        Action::Regenerate { session_id, model } => {
            let stream = engine
                .regenerate_last_message(&session_id, owner, &model)
                .await?;
            follow(stream).await
        }
        Action::Pop { session_id } => {
            print_json(&engine.delete_last_message(&session_id, owner).await?)
        }
        Action::Delete { session_id } => {
            engine.delete_session(&session_id, owner).await?;
            print_json(&serde_json::json!({ "deleted": session_id }))
        }
    }
}

/// Prints fragments as they arrive. Ctrl-C detaches from the stream but
/// still waits for the answer to be committed.
async fn follow(mut stream: ResponseStream) -> Result<(), EngineError> {
    let mut stdout = std::io::stdout();
    let detached = loop {
        let fragment = tokio::select! {
            fragment = stream.next_fragment() => fragment,
            _ = tokio::signal::ctrl_c() => break true,
        };

        match fragment {
            Some(fragment) if is_error_fragment(&fragment) => eprintln!("\n{}", fragment),
            Some(fragment) => {
                print!("{}", fragment);
                stdout.flush().map_err(EngineError::internal)?;
            }
            None => break false,
        }
    };
    println!();

    if detached {
        eprintln!("Detached, waiting for the answer to be committed...");
    }

    let session_id = stream.session_id().to_string();
    let message = stream.into_commit().wait().await?;
    log::info!(
        "Committed message {} of session {} (failed: {})",
        message.message_idx,
        session_id,
        message.failed
    );
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), EngineError> {
    let out = serde_json::to_string_pretty(value).map_err(EngineError::internal)?;
    println!("{}", out);
    Ok(())
}
