//! CLI entry points: `steer generate` and `steer list-models`.

use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use serde_json::{Map, json};

use crate::router::Client;

#[derive(Parser)]
#[command(name = "steer")]
#[command(about = "Multi-provider LLM client")]
#[command(version = crate::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate text using an LLM
    Generate {
        /// Model name (e.g. "gpt-4o-mini")
        model: String,
        /// Text prompt
        prompt: String,
        #[arg(long)]
        max_tokens: Option<u32>,
        /// Temperature (0.0-2.0)
        #[arg(long)]
        temperature: Option<f64>,
        /// Stream the response
        #[arg(long)]
        stream: bool,
    },
    /// List available models
    ListModels,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Generate {
            model,
            prompt,
            max_tokens,
            temperature,
            stream,
        } => generate(&model, &prompt, max_tokens, temperature, stream).await,
        Commands::ListModels => {
            list_models();
            Ok(())
        }
    }
}

async fn generate(
    model: &str,
    prompt: &str,
    max_tokens: Option<u32>,
    temperature: Option<f64>,
    stream: bool,
) -> Result<()> {
    let client = Client::new();
    let mut params = Map::new();
    if let Some(max_tokens) = max_tokens {
        params.insert("max_tokens".into(), json!(max_tokens));
    }
    if let Some(temperature) = temperature {
        params.insert("temperature".into(), json!(temperature));
    }

    if stream {
        use std::io::Write;
        println!("Streaming response from {}:\n", model);
        let mut chunks = client.stream(prompt, model, &params).await?;
        while let Some(chunk) = chunks.next().await {
            print!("{}", chunk?);
            std::io::stdout().flush().ok();
        }
        println!();
    } else {
        let result = client.generate(prompt, model, &params).await?;
        println!("Response from {}:\n", model);
        println!("{}", result.text);
        println!(
            "\nTokens used: {} prompt + {} completion = {}",
            result.usage.prompt_tokens, result.usage.completion_tokens, result.usage.total_tokens
        );
        if let Some(cost) = result.cost_usd {
            println!("Cost: ${:.6}", cost);
        }
    }
    Ok(())
}

fn list_models() {
    let client = Client::new();
    println!("Available Models:");
    println!("{}", "-".repeat(50));
    for model in client.get_available_models() {
        let status = if model.available { "+" } else { "-" };
        println!("{} {} ({})", status, model.name, model.provider);
        println!("   {}", model.description.replace('\n', "\n   "));
        if let (Some(input), Some(output)) = (
            model.input_cost_per_1k_tokens,
            model.output_cost_per_1k_tokens,
        ) {
            println!("   Cost: ${}/1k in, ${}/1k out", input, output);
        }
        println!();
    }
}
