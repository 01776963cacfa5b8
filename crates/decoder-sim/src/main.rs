use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use decoding_core::DecoderConfig;
use supervised_decoder::{DecodingCurve, StreamingDecoder, SupervisedDecoder};

mod config;

use config::SimConfig;

/// Outcome of streaming one trial until the decoder was confident enough.
#[derive(Debug, Serialize)]
struct TrialOutcome {
    trial: usize,
    target: usize,
    selected: i64,
    error_probability: f64,
    /// Epochs seen when the session acted, `None` if it never did.
    acted_after: Option<usize>,
}

#[derive(Debug, Serialize)]
struct Report {
    trials: Vec<TrialOutcome>,
    curve: DecodingCurve,
}

fn main() -> Result<()> {
    // 1. Load .env, init tracing
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("RUST_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .init();
    }

    tracing::info!("Starting simulated decoding session");

    // 2. Load configuration
    let decoder_config = DecoderConfig::from_env()?;
    let sim = SimConfig::from_env()?;
    tracing::info!("  Softmax scale: {}", decoder_config.softmax_scale);
    tracing::info!("  Epoch correction: {}", decoder_config.normalizer.epoch_correction);
    tracing::info!("  Outlier threshold: {}", decoder_config.normalizer.outlier_threshold);
    tracing::info!(
        "  Session: {} trials x {} epochs, {} candidates, signal {}",
        sim.n_trials,
        sim.n_epochs,
        sim.n_candidates,
        sim.signal_mean
    );

    // 3. Generate the recording
    let mut rng = StdRng::seed_from_u64(sim.seed);
    let session = sim.session().generate(&mut rng)?;

    // 4. Stream each trial block by block, act once Perr is low enough
    let mut trials = Vec::with_capacity(sim.n_trials);
    for (trial, &target) in session.targets.iter().enumerate() {
        let trial_scores = single_trial(&session.scores, trial);
        let mut stream = StreamingDecoder::new(decoder_config.clone())?;
        let mut outcome = TrialOutcome {
            trial,
            target,
            selected: decoding_core::NO_SELECTION,
            error_probability: 1.0,
            acted_after: None,
        };

        let mut start = 0;
        while start < sim.n_epochs {
            let end = (start + sim.block_epochs).min(sim.n_epochs);
            let record = stream.push_and_decide(&trial_scores.epoch_range(start, end), &mut rng)?;
            start = end;

            let Some((selected, perr)) = record.latest(0, 0) else {
                continue;
            };
            outcome.selected = selected;
            outcome.error_probability = perr;
            if selected >= 0 && perr < sim.act_threshold {
                tracing::info!(trial, target, selected, perr, epochs = end, "Act");
                outcome.acted_after = Some(end);
                break;
            }
            tracing::debug!(trial, selected, perr, epochs = end, "Wait");
        }

        if outcome.acted_after.is_none() {
            tracing::warn!(trial, target, perr = outcome.error_probability, "Never confident enough to act");
        }
        trials.push(outcome);
    }

    let acted: Vec<&TrialOutcome> = trials.iter().filter(|t| t.acted_after.is_some()).collect();
    let correct = acted.iter().filter(|t| t.selected == t.target as i64).count();
    tracing::info!(
        "Acted on {}/{} trials, {} correct",
        acted.len(),
        trials.len(),
        correct
    );

    // 5. Offline decoding curve over the full recording
    let batch = SupervisedDecoder::new(decoder_config)?;
    let record = batch.decode(Some(&session.scores), &mut rng)?;
    let curve = DecodingCurve::from_record(&record, &session.targets)?;
    if let Some(epochs) = curve.epochs_to_accuracy(0.9) {
        tracing::info!("90% accuracy reached after {} epochs", epochs);
    }
    tracing::info!(
        "Calibration: ECE {:.3}, Brier {:.3}",
        curve.calibration.ece,
        curve.calibration.brier_score
    );

    println!("{}", serde_json::to_string_pretty(&Report { trials, curve })?);
    Ok(())
}

/// The epochs of one trial as a single-trial tensor.
fn single_trial(scores: &decoding_core::ScoreTensor, trial: usize) -> decoding_core::ScoreTensor {
    let [n_models, _, n_epochs, n_candidates] = scores.shape();
    decoding_core::ScoreTensor::from_fn([n_models, 1, n_epochs, n_candidates], |m, _, e, y| {
        scores.get(m, trial, e, y)
    })
}
