use fpna_copilot::{CopilotConfig, FinanceCopilot, MetricResult};
use std::io::{self, BufRead, Write};

fn print_answer(answer: &MetricResult) {
    println!("\n{}", answer.answer_text);
    for headline in &answer.headline {
        println!("  {:<16} {}", headline.label, headline.figure);
    }
    if !answer.series.is_empty() {
        println!("  chart: {:?}", answer.chart);
        for point in &answer.series {
            println!("    {:<12} {:>16.2}", point.label, point.value);
        }
    }
    for warning in &answer.warnings {
        println!("  ⚠️  {}", warning);
    }
}

/// Usage: `cargo run --example ask -- <csv-dir> [question...]`
///
/// With no question on the command line, reads questions from stdin until
/// `quit`.
fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let dir = args.next().unwrap_or_else(|| "fixtures".to_string());
    let question: Vec<String> = args.collect();

    let config = match std::env::var("FPNA_CONFIG") {
        Ok(path) => CopilotConfig::from_path(path)?,
        Err(_) => CopilotConfig::default(),
    };
    let copilot = FinanceCopilot::from_csv_dir(&dir, config)?;
    println!("✅ Loaded tables from {}", dir);

    if !question.is_empty() {
        print_answer(&copilot.ask(&question.join(" ")));
        return Ok(());
    }

    println!("Ask a finance question (type 'quit' to exit).");
    let stdin = io::stdin();
    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.lock().read_line(&mut input)? == 0 {
            break;
        }
        let prompt = input.trim();
        if prompt.eq_ignore_ascii_case("quit") || prompt.eq_ignore_ascii_case("exit") {
            break;
        }
        if prompt.is_empty() {
            continue;
        }
        print_answer(&copilot.ask(prompt));
    }

    Ok(())
}
