/*!
# Saving Experiment Output as CSV

Long-format tables of the density curves and the raw posterior draws, for
plotting outside of Rust. Enable via the `csv` feature.
*/

use std::error::Error;
use std::fs::File;
use std::path::Path;

use csv::Writer;

use crate::experiment::ExperimentResult;
use crate::model::PARAMETER_NAMES;
use crate::summary::SummaryArtifact;

/**
Saves the density curves of a [`SummaryArtifact`] as a CSV file.

The file has the header `sample_size,prior,x,density` and one row per grid
point of every successful cell. Failed cells contribute no rows.

# Arguments

* `artifact` - The comparison artifact produced by a `SummaryReporter`.
* `filename` - The file path where the CSV data will be written.

# Returns

Returns `Ok(())` if successful, or an error if any I/O or CSV formatting
issue occurs.
*/
pub fn save_densities<P: AsRef<Path>>(
    artifact: &SummaryArtifact,
    filename: P,
) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);
    wtr.write_record(["sample_size", "prior", "x", "density"])?;
    for panel in &artifact.panels {
        for curve in &panel.curves {
            let Some(density) = &curve.density else {
                continue;
            };
            for (x, d) in panel.grid.iter().zip(density) {
                wtr.write_record([
                    panel.sample_size.to_string(),
                    curve.prior.clone(),
                    x.to_string(),
                    d.to_string(),
                ])?;
            }
        }
    }
    wtr.flush()?;
    Ok(())
}

/**
Saves every post-warmup draw of an experiment as a CSV file.

Columns are `sample_size`, `prior`, `chain`, `iteration` followed by one
column per model parameter (`intercept`, `slope`, `log_noise_scale`).
*/
pub fn save_draws<P: AsRef<Path>>(
    result: &ExperimentResult,
    filename: P,
) -> Result<(), Box<dyn Error>> {
    let mut wtr = Writer::from_writer(File::create(filename)?);
    let mut header = vec!["sample_size", "prior", "chain", "iteration"];
    header.extend(PARAMETER_NAMES);
    wtr.write_record(&header)?;

    for cell in &result.cells {
        let Some(fit) = cell.fit() else {
            continue;
        };
        for draw in fit.chains.iter().flatten() {
            let mut row = vec![
                cell.sample_size.to_string(),
                cell.prior.name.clone(),
                draw.chain.to_string(),
                draw.iteration.to_string(),
            ];
            row.extend(draw.params.as_array().iter().map(|v| v.to_string()));
            wtr.write_record(&row)?;
        }
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::TrueParams;
    use crate::experiment::ExperimentOrchestrator;
    use crate::model::{PriorSpec, SlopePrior};
    use crate::sampler::SamplerConfig;
    use crate::summary::SummaryReporter;
    use csv::Reader;
    use std::fs;
    use tempfile::NamedTempFile;

    fn small_result() -> ExperimentResult {
        let priors = vec![
            PriorSpec::new(10.0, SlopePrior::Flat, 5.0).unwrap(),
            PriorSpec::new(10.0, SlopePrior::Normal { sd: 1.0 }, 5.0).unwrap(),
        ];
        let truth = TrueParams {
            intercept: 1.0,
            slope: 2.0,
            noise_sd: 0.5,
        };
        ExperimentOrchestrator::new(vec![10, 30], priors, truth, 5)
            .unwrap()
            .with_chains(2)
            .unwrap()
            .with_sampler(SamplerConfig {
                n_warmup: 100,
                n_sampling: 50,
                ..SamplerConfig::default()
            })
            .unwrap()
            .run()
            .unwrap()
    }

    #[test]
    fn test_save_densities() -> Result<(), Box<dyn Error>> {
        let result = small_result();
        let artifact = SummaryReporter::new(64).report(&result);
        let file = NamedTempFile::new()?;
        save_densities(&artifact, file.path())?;

        let contents = fs::read_to_string(file.path())?;
        let mut rdr = Reader::from_reader(contents.as_bytes());
        assert_eq!(
            rdr.headers()?.iter().collect::<Vec<_>>(),
            vec!["sample_size", "prior", "x", "density"]
        );
        let records: Vec<_> = rdr.records().collect::<Result<_, _>>()?;
        // 2 sizes * 2 priors * 64 grid points.
        assert_eq!(records.len(), 256);
        assert_eq!(&records[0][0], "10");
        assert_eq!(&records[0][1], "flat");
        assert!(records.iter().all(|r| r[3].parse::<f64>().unwrap() >= 0.0));
        Ok(())
    }

    #[test]
    fn test_save_draws() -> Result<(), Box<dyn Error>> {
        let result = small_result();
        let file = NamedTempFile::new()?;
        save_draws(&result, file.path())?;

        let mut rdr = Reader::from_path(file.path())?;
        assert_eq!(
            rdr.headers()?.iter().collect::<Vec<_>>(),
            vec![
                "sample_size",
                "prior",
                "chain",
                "iteration",
                "intercept",
                "slope",
                "log_noise_scale"
            ]
        );
        let records: Vec<_> = rdr.records().collect::<Result<_, _>>()?;
        // 4 cells * 2 chains * 50 draws.
        assert_eq!(records.len(), 400);
        Ok(())
    }
}
