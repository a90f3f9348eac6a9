use std::time::Duration;

use anyhow::Result;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use preval_quantifiers::aggregative::PACC;
use preval_quantifiers::classifier::CentroidClassifier;
use preval_quantifiers::config::ExecutionContext;
use preval_quantifiers::data::LabelledCollection;
use preval_quantifiers::evaluation::ErrorMetric;
use preval_quantifiers::model_selection::{format_config, GridSearch, ParamGrid, ParamValue};
use preval_quantifiers::protocol::ArtificialPrevalenceProtocol;

fn make_data(n_per_class: &[usize], seed: u64) -> LabelledCollection {
    let mut rng = StdRng::seed_from_u64(seed);
    let total: usize = n_per_class.iter().sum();
    let mut rows = Vec::with_capacity(total * 2);
    let mut labels = Vec::with_capacity(total);
    for (class, &n) in n_per_class.iter().enumerate() {
        let center = class as f64 * 2.0;
        for _ in 0..n {
            rows.push(center + rng.gen_range(-1.2..1.2));
            rows.push(center + rng.gen_range(-1.2..1.2));
            labels.push(class);
        }
    }
    let x = Array2::from_shape_vec((total, 2), rows).expect("failed to create feature matrix");
    LabelledCollection::new(x, labels, n_per_class.len()).expect("failed to build collection")
}

fn main() -> Result<()> {
    env_logger::init();

    let training = make_data(&[150, 150], 7);
    let validation = make_data(&[100, 100], 8);

    let grid = ParamGrid::new()
        .add(
            "classifier__temperature",
            vec![
                ParamValue::Float(0.5),
                ParamValue::Float(1.0),
                ParamValue::Float(2.0),
            ],
        )
        .add("val_split", vec![ParamValue::Int(3), ParamValue::Int(5)]);

    let protocol = ArtificialPrevalenceProtocol::new(validation, 50, 99).with_grid(11, 3);
    let base = PACC::new(Box::new(CentroidClassifier::default()));

    let mut search = GridSearch::new(Box::new(base), grid, Box::new(protocol), ErrorMetric::Mae)
        .with_refit(true)
        .with_timeout(Duration::from_secs(30))
        .with_context(ExecutionContext::default());

    search.fit(&training)?;

    println!("scores per configuration:");
    for (config, outcome) in search.param_scores() {
        println!("  {} -> {:?}", format_config(config), outcome);
    }
    if let (Some(params), Some(score)) = (search.best_params(), search.best_score()) {
        println!("best configuration: {} (mae={:.5})", format_config(params), score);
    }

    let shifted = make_data(&[20, 80], 21);
    let estimate = search.quantify(shifted.instances())?;
    println!("true prevalence {:.3}", shifted.prevalence());
    println!("estimated prevalence {:.3}", estimate);

    Ok(())
}
