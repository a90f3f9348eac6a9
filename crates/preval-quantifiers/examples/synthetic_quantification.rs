use anyhow::Result;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use preval_quantifiers::aggregative::{Quantifier, ACC, CC, EMQ, PACC, PCC};
use preval_quantifiers::classifier::CentroidClassifier;
use preval_quantifiers::config::ExecutionContext;
use preval_quantifiers::data::LabelledCollection;

/// Two noisy clusters around (0,0) and (3,3).
fn make_data(n_per_class: &[usize], seed: u64) -> LabelledCollection {
    let mut rng = StdRng::seed_from_u64(seed);
    let total: usize = n_per_class.iter().sum();
    let mut rows = Vec::with_capacity(total * 2);
    let mut labels = Vec::with_capacity(total);
    for (class, &n) in n_per_class.iter().enumerate() {
        let center = class as f64 * 3.0;
        for _ in 0..n {
            rows.push(center + rng.gen_range(-1.0..1.0));
            rows.push(center + rng.gen_range(-1.0..1.0));
            labels.push(class);
        }
    }
    let x = Array2::from_shape_vec((total, 2), rows).expect("failed to create feature matrix");
    LabelledCollection::new(x, labels, n_per_class.len()).expect("failed to build collection")
}

fn main() -> Result<()> {
    env_logger::init();

    // Balanced training data, strongly shifted test sample
    let training = make_data(&[200, 200], 42);
    let test = make_data(&[30, 120], 1337);

    println!("training prevalence: {:.3}", training.prevalence());
    println!("true test prevalence: {:.3}", test.prevalence());

    let ctx = ExecutionContext::default();
    let mut methods: Vec<Box<dyn Quantifier>> = vec![
        Box::new(CC::new(Box::new(CentroidClassifier::default()))),
        Box::new(ACC::new(Box::new(CentroidClassifier::default()))),
        Box::new(PCC::new(Box::new(CentroidClassifier::default()))),
        Box::new(PACC::new(Box::new(CentroidClassifier::default()))),
        Box::new(EMQ::new(Box::new(CentroidClassifier::default()))),
    ];

    for method in methods.iter_mut() {
        method.fit(&training, &ctx)?;
        let estimate = method.quantify(test.instances())?;
        println!("{:>5}: estimated prevalence {:.3}", method.name(), estimate);
    }

    Ok(())
}
