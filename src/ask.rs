//! `docchat ask` and `docchat chat`.
//!
//! Both print the answer to stdout as it streams in, followed by the first
//! source chunk. `chat` keeps a [`ChatSession`] so follow-up questions see
//! the earlier turns.

use anyhow::Result;
use futures::StreamExt;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::config::Config;
use crate::pipeline::{QueryPipeline, QueryRequest, QueryResponse};
use crate::session::ChatSession;

/// Answer a single question.
pub async fn run_ask(config: &Config, question: &str, no_stream: bool) -> Result<()> {
    let mut config = config.clone();
    if no_stream {
        config.generation.streaming = false;
    }
    let pipeline = QueryPipeline::from_config(&config).await?;

    let response = pipeline.query(QueryRequest::new(question)).await;
    print_response(response).await?;
    Ok(())
}

/// Interactive loop on stdin. `/clear` forgets the conversation, `/exit`
/// (or end of input) quits.
pub async fn run_chat(config: &Config) -> Result<()> {
    let pipeline = QueryPipeline::from_config(config).await?;
    let mut session = ChatSession::new();

    println!("docchat: ask a question, /clear to reset, /exit to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            println!();
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                session.clear();
                println!("(conversation cleared)");
                continue;
            }
            _ => {}
        }

        let response = pipeline.query(session.begin_turn(line)).await;
        let (answer, source) = print_response(response).await?;
        session.finish_turn(line, &answer, source);
    }
    Ok(())
}

/// Print the answer (fragment by fragment when streaming) and its first
/// source. Returns the full answer text and that source's text.
async fn print_response(mut response: QueryResponse) -> Result<(String, Option<String>)> {
    let mut stdout = std::io::stdout();
    let answer = match response.take_fragments() {
        Some(mut fragments) => {
            let mut answer = String::new();
            while let Some(fragment) = fragments.next().await {
                print!("{}", fragment);
                stdout.flush()?;
                answer.push_str(&fragment);
            }
            println!();
            answer
        }
        None => {
            println!("{}", response.text);
            response.text.clone()
        }
    };

    response.settle();
    if let Some(first) = response.sources.first() {
        println!();
        println!(
            "Source: {} (chunk {}, score {:.3})",
            first.chunk.source, first.chunk.chunk_index, first.score
        );
        println!("{}", first.chunk.text);
    }
    Ok((answer, response.source_text().map(str::to_string)))
}
