// Copyright 2016-2019 Johannes Köster, David Lähnemann.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Model artifact persistence.
//!
//! A fitted model is stored as one versioned artifact holding the
//! human-readable fit information (JSON, with an explicit kind tag), the
//! fitted parameters, and the packed per-bin log-null vectors. Loading
//! verifies the deterministic identifier and the chromosome sizes against
//! the requested configuration and reports the first disagreeing field.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use data_encoding::HEXLOWER;
use log::{info, warn};
use ring::digest;
use serde::{Deserialize, Serialize};

use crate::errors::Error;
use crate::genome::GenomeLayout;
use crate::hmm::{FitFlags, FitResult, HmmParameters, ModelKind};

pub const MODEL_FORMAT_VERSION: u32 = 1;

/// Identifier length in hex characters.
const ID_LENGTH: usize = 16;

/// Reduce the fit configuration to a deterministic identifier: input file
/// stems, nullable fragment, bin size, and the unique / no-regression
/// markers, hashed and hex-encoded.
pub fn reduce_id(
    stems: &[&str],
    fragment: Option<u32>,
    bin_size: u32,
    unique: bool,
    regress_control: bool,
) -> String {
    let mut sorted: Vec<&str> = stems.to_vec();
    sorted.sort_unstable();
    let mut reduced = sorted.join(",");
    reduced.push('#');
    match fragment {
        Some(fragment) => reduced.push_str(&fragment.to_string()),
        None => reduced.push_str("auto"),
    }
    reduced.push('#');
    reduced.push_str(&bin_size.to_string());
    if unique {
        reduced.push_str("#unique");
    }
    if !regress_control {
        reduced.push_str("#no-regress-control");
    }
    let hash = digest::digest(&digest::SHA256, reduced.as_bytes());
    HEXLOWER.encode(hash.as_ref())[..ID_LENGTH].to_owned()
}

/// Configuration under which a model was fitted. The kind tag explicitly
/// discriminates analyze from compare fits; no type names are stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitInformation {
    pub kind: ModelKind,
    pub identifier: String,
    /// Stems of the input files, sorted.
    pub paths: Vec<String>,
    pub bin_size: u32,
    pub fragment: Option<u32>,
    pub unique: bool,
    pub regress_control: bool,
    /// (name, length) pairs in name order.
    pub chromosome_sizes: Vec<(String, u64)>,
}

impl FitInformation {
    pub fn new(
        kind: ModelKind,
        stems: &[&str],
        layout: &GenomeLayout,
        fragment: Option<u32>,
        unique: bool,
        regress_control: bool,
    ) -> Self {
        let mut paths: Vec<String> = stems.iter().map(|s| s.to_string()).collect();
        paths.sort_unstable();
        FitInformation {
            kind,
            identifier: reduce_id(stems, fragment, layout.bin_size(), unique, regress_control),
            paths,
            bin_size: layout.bin_size(),
            fragment,
            unique,
            regress_control,
            chromosome_sizes: layout
                .chromosomes()
                .map(|c| (c.name().to_owned(), c.length()))
                .collect(),
        }
    }

    /// Check the persisted configuration against the requested one; the
    /// first disagreeing field is reported.
    pub fn check_compatible(&self, requested: &FitInformation) -> Result<(), Error> {
        if self.kind != requested.kind {
            return Err(Error::IncompatibleFit {
                field: "model kind",
                stored: format!("{:?}", self.kind),
                requested: format!("{:?}", requested.kind),
            });
        }
        if self.identifier != requested.identifier {
            return Err(Error::IncompatibleFit {
                field: "identifier",
                stored: self.identifier.clone(),
                requested: requested.identifier.clone(),
            });
        }
        if self.chromosome_sizes != requested.chromosome_sizes {
            return Err(Error::IncompatibleFit {
                field: "chromosome sizes",
                stored: format!("{} chromosomes", self.chromosome_sizes.len()),
                requested: format!("{} chromosomes", requested.chromosome_sizes.len()),
            });
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct StoredFlags {
    converged: bool,
    low_quality_flip: bool,
    out_of_snr_range: bool,
    unimodal_coverage: bool,
}

/// On-disk representation of a fitted model.
#[derive(Serialize, Deserialize)]
pub struct ModelArtifact {
    version: u32,
    /// JSON blob, kept readable for debugging.
    fit_information: String,
    parameters: HmmParameters,
    log_likelihood: f64,
    flags: StoredFlags,
    log_null: Vec<(String, Vec<f32>)>,
}

impl ModelArtifact {
    pub fn new(information: &FitInformation, fit: &FitResult) -> Result<Self, Error> {
        let fit_information = serde_json::to_string(information)
            .expect("fit information serializes infallibly");
        Ok(ModelArtifact {
            version: MODEL_FORMAT_VERSION,
            fit_information,
            parameters: fit.parameters().clone(),
            log_likelihood: fit.log_likelihood(),
            flags: StoredFlags {
                converged: fit.flags().converged,
                low_quality_flip: fit.flags().low_quality_flip,
                out_of_snr_range: fit.flags().out_of_snr_range,
                unimodal_coverage: fit.flags().unimodal_coverage,
            },
            log_null: fit
                .log_null_map()
                .iter()
                .map(|(name, values)| (name.clone(), values.clone()))
                .collect(),
        })
    }

    pub fn fit_information(&self) -> Result<FitInformation, Error> {
        serde_json::from_str(&self.fit_information).map_err(|e| Error::UnreadableInput {
            path: "<artifact fit information>".into(),
            msg: e.to_string(),
        })
    }

    pub fn into_fit_result(self) -> FitResult {
        let flags = FitFlags {
            converged: self.flags.converged,
            low_quality_flip: self.flags.low_quality_flip,
            out_of_snr_range: self.flags.out_of_snr_range,
            unimodal_coverage: self.flags.unimodal_coverage,
        };
        FitResult::from_parts(
            self.parameters,
            self.log_likelihood,
            flags,
            self.log_null.into_iter().collect(),
        )
    }
}

/// Write the artifact atomically: into a temporary sibling first, then
/// rename. A failed write is cleaned up and retried once.
pub fn save<P: AsRef<Path>>(path: P, artifact: &ModelArtifact) -> Result<(), Error> {
    let path = path.as_ref();
    match try_save(path, artifact) {
        Ok(()) => Ok(()),
        Err(first) => {
            warn!("writing model artifact failed ({}); retrying once", first);
            try_save(path, artifact).map_err(|msg| Error::ModelWriteFailed {
                path: path.to_owned(),
                msg,
            })
        }
    }
}

fn try_save(path: &Path, artifact: &ModelArtifact) -> Result<(), String> {
    let directory = path.parent().unwrap_or_else(|| Path::new("."));
    let temporary = tempfile::NamedTempFile::new_in(directory).map_err(|e| e.to_string())?;
    {
        let mut writer = BufWriter::new(temporary.as_file());
        bincode::serialize_into(&mut writer, artifact).map_err(|e| e.to_string())?;
        writer.flush().map_err(|e| e.to_string())?;
    }
    // a failed persist drops the temporary, leaving no partial file behind
    temporary.persist(path).map_err(|e| e.to_string())?;
    info!("model artifact saved to {}", path.display());
    Ok(())
}

pub fn load<P: AsRef<Path>>(path: P) -> Result<ModelArtifact, Error> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| Error::UnreadableInput {
        path: path.to_owned(),
        msg: e.to_string(),
    })?;
    let artifact: ModelArtifact =
        bincode::deserialize_from(BufReader::new(file)).map_err(|e| Error::UnreadableInput {
            path: path.to_owned(),
            msg: e.to_string(),
        })?;
    if artifact.version != MODEL_FORMAT_VERSION {
        return Err(Error::UnsupportedModelVersion {
            version: artifact.version,
            expected: MODEL_FORMAT_VERSION,
        });
    }
    Ok(artifact)
}

/// Load an artifact and verify it against the requested configuration.
pub fn load_compatible<P: AsRef<Path>>(
    path: P,
    requested: &FitInformation,
) -> Result<FitResult, Error> {
    let artifact = load(path)?;
    artifact.fit_information()?.check_compatible(requested)?;
    Ok(artifact.into_fit_result())
}
