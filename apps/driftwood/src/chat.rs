use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, bail};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::timeout;

use driftwood::attachment::{ImageFile, describe_data_url};
use driftwood::protocol::{Message, MessageKind, Sender};
use driftwood::{ConnectionSession, ConnectionState, Delivery, SessionUpdate};

pub type Input = Lines<BufReader<Stdin>>;

pub fn stdin_lines() -> Input {
    BufReader::new(tokio::io::stdin()).lines()
}

#[derive(Debug, PartialEq, Eq)]
enum Line<'a> {
    Text(&'a str),
    Image(&'a str),
    Quit,
    Blank,
}

impl<'a> Line<'a> {
    fn parse(raw: &'a str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Line::Blank;
        }
        if trimmed == "/quit" {
            return Line::Quit;
        }
        match trimmed.strip_prefix("/image ") {
            Some(path) if !path.trim().is_empty() => Line::Image(path.trim()),
            _ => Line::Text(raw),
        }
    }
}

/// Reads lines until one is non-blank. Tokens are single-line base64.
async fn read_token(input: &mut Input, prompt: &str) -> anyhow::Result<String> {
    eprintln!("{prompt}");
    while let Some(line) = input.next_line().await? {
        if !line.trim().is_empty() {
            return Ok(line.trim().to_string());
        }
    }
    bail!("stdin closed before a token was entered")
}

pub async fn offer(
    session: &ConnectionSession,
    input: &mut Input,
    connect_timeout: Duration,
) -> anyhow::Result<()> {
    eprintln!("Gathering candidates...");
    let token = session
        .create_offer()
        .await
        .context("creating offer")?;
    eprintln!("Send this offer token to your peer:");
    println!("{token}");

    let answer = read_token(input, "Paste the answer token:").await?;
    session
        .accept_answer(&answer)
        .await
        .context("accepting answer")?;
    wait_connected(session, connect_timeout).await?;
    converse(session, input).await
}

pub async fn join(
    session: &ConnectionSession,
    input: &mut Input,
    token: Option<String>,
    connect_timeout: Duration,
) -> anyhow::Result<()> {
    let offer = match token {
        Some(token) => token,
        None => read_token(input, "Paste the offer token:").await?,
    };
    eprintln!("Gathering candidates...");
    let answer = session
        .accept_offer(&offer)
        .await
        .context("accepting offer")?;
    eprintln!("Send this answer token back to your peer:");
    println!("{answer}");
    wait_connected(session, connect_timeout).await?;
    converse(session, input).await
}

async fn wait_connected(session: &ConnectionSession, limit: Duration) -> anyhow::Result<()> {
    let mut state = session.watch_state();
    let settled = timeout(
        limit,
        state.wait_for(|state| *state != ConnectionState::Connecting),
    )
    .await
    .context("timed out waiting for the peer")?
    .map(|state| *state)
    .context("session dropped while connecting")?;
    match settled {
        ConnectionState::Connected => Ok(()),
        other => bail!("connection ended in state {other}"),
    }
}

async fn converse(session: &ConnectionSession, input: &mut Input) -> anyhow::Result<()> {
    let mut updates = session.subscribe();
    let mut state = session.watch_state();
    let mut seen = HashSet::new();
    for message in session.messages() {
        seen.insert(message.id);
        render(&message);
    }
    eprintln!("Type to chat. `/image <path>` sends a picture, `/quit` leaves.");

    loop {
        tokio::select! {
            line = input.next_line() => {
                let Some(line) = line? else { break };
                match Line::parse(&line) {
                    Line::Blank => {}
                    Line::Quit => break,
                    Line::Text(text) => report(session.send(text).await),
                    Line::Image(path) => match ImageFile::read(path).await {
                        Ok(file) => report(session.send_image(file).await),
                        Err(err) => eprintln!("cannot read {path}: {err}"),
                    },
                }
            }
            update = updates.recv() => match update {
                Ok(SessionUpdate::Appended(message)) => {
                    if seen.insert(message.id) && should_echo(&message) {
                        render(&message);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "chat display fell behind");
                }
                Err(RecvError::Closed) => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if matches!(current, ConnectionState::Disconnected | ConnectionState::Failed) {
                    eprintln!("Connection {current}.");
                    break;
                }
            }
        }
    }
    Ok(())
}

fn report(delivery: Delivery) {
    if let Delivery::Rejected(err) = delivery {
        eprintln!("not sent: {err}");
    }
}

/// Own text is already on screen as typed.
fn should_echo(message: &Message) -> bool {
    !(message.sender == Sender::Me && message.kind == MessageKind::Text)
}

fn render(message: &Message) {
    match message.kind {
        MessageKind::Image => {
            let who = match message.sender {
                Sender::Me => "me",
                Sender::Peer => "peer",
            };
            match describe_data_url(&message.content) {
                Some((mime, len)) => println!("{who}: [image {mime}, {len} bytes]"),
                None => println!("{who}: [image]"),
            }
        }
        _ => println!("{message}"),
    }
}
