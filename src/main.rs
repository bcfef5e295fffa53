use clap::{Parser, Subcommand};
use std::process;
use svytweedie::analysis::{run_analysis, AnalysisOptions};
use svytweedie::data::load_survey_data;
use svytweedie::design::LonelyPsu;
use svytweedie::family::Tweedie;
use svytweedie::recode::PovertyCategory;
use svytweedie::report;

#[derive(Parser)]
#[command(
    name = "svytweedie",
    about = "Survey-weighted Tweedie GLM analysis of health expenditures",
    long_about = "Fits a design-weighted Tweedie GLM (gamma family, identity link by default) of \
                 total expenditure on gender, poverty category, and their interaction, then runs \
                 goodness-of-fit diagnostics and average marginal effects."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full analysis pipeline over a survey extract
    #[command(about = "Analyze a TSV extract (columns: id, weight, stratum, psu, totexp, sex, povcat)")]
    Analyze {
        /// Path to the tab-separated survey extract
        data: String,

        /// Tweedie variance power (2 = gamma)
        #[arg(long, default_value = "2.0")]
        var_power: f64,

        /// Link power (1 = identity, 0 = log)
        #[arg(long, default_value = "1.0")]
        link_power: f64,

        /// Group count for the grouped fit test
        #[arg(long, default_value = "10")]
        groups: usize,

        /// Lonely-PSU handling: "adjust" or "fail"
        #[arg(long, default_value = "adjust")]
        lonely_psu: String,

        /// Reference poverty category code (1-5)
        #[arg(long, default_value = "1")]
        reference: u8,

        /// Maximum number of IRLS iterations
        #[arg(long, default_value = "50")]
        max_iter: usize,

        /// Convergence tolerance for IRLS
        #[arg(long, default_value = "1e-8")]
        tolerance: f64,

        /// Optional path to save the fitted model (.toml)
        #[arg(long)]
        save_model: Option<String>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Analyze {
            data,
            var_power,
            link_power,
            groups,
            lonely_psu,
            reference,
            max_iter,
            tolerance,
            save_model,
        } => analyze_command(
            &data,
            var_power,
            link_power,
            groups,
            &lonely_psu,
            reference,
            max_iter,
            tolerance,
            save_model.as_deref(),
        ),
    };

    if let Err(message) = result {
        eprintln!("Error: {message}");
        process::exit(1);
    }
}

#[allow(clippy::too_many_arguments)]
fn analyze_command(
    data_path: &str,
    var_power: f64,
    link_power: f64,
    groups: usize,
    lonely_psu: &str,
    reference_code: u8,
    max_iter: usize,
    tolerance: f64,
    save_model: Option<&str>,
) -> Result<(), String> {
    let lonely = match lonely_psu {
        "adjust" => LonelyPsu::Adjust,
        "fail" => LonelyPsu::Fail,
        other => return Err(format!("unknown lonely-psu policy '{other}' (use adjust|fail)")),
    };
    let reference = PovertyCategory::from_code(reference_code as f64)
        .ok_or_else(|| format!("reference poverty category must be 1-5, got {reference_code}"))?;

    let data = load_survey_data(data_path).map_err(|e| e.to_string())?;
    let options = AnalysisOptions {
        family: Tweedie::new(var_power, link_power),
        reference,
        lonely_psu: lonely,
        groups,
        max_iterations: max_iter,
        tolerance,
    };
    let analysis = run_analysis(&data, &options).map_err(|e| e.to_string())?;

    println!("{}", report::coefficient_table(&analysis.model));
    println!(
        "{}",
        report::diagnostics_report(&analysis.correlation, &analysis.link, &analysis.grouped)
    );
    println!(
        "{}",
        report::marginal_effects_table(&analysis.margins, reference)
    );
    println!(
        "{}",
        report::interaction_profile(&analysis.model).map_err(|e| e.to_string())?
    );

    if let Some(path) = save_model {
        analysis.model.save(path).map_err(|e| e.to_string())?;
        println!("Fitted model saved to {path}");
    }
    Ok(())
}
