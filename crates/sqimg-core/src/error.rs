use std::process::ExitStatus;

/// Failures callers may want to match on. Everything else travels as a plain
/// `anyhow::Error` with path or URL context attached.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("{program} failed ({status}): {output}")]
    PackagerFailed {
        program: String,
        status: ExitStatus,
        output: String,
    },
    #[error("blob store rejected PUT {url}: unexpected HTTP status {status}")]
    UploadRejected { url: String, status: u16 },
    #[error("artifact registry rejected {url}: unexpected HTTP status {status}: {body}")]
    RegistryRejected {
        url: String,
        status: u16,
        body: String,
    },
    #[error("image {name} not found")]
    ImageNotFound { name: String },
    #[error("diff {id} not found")]
    UnknownDiff { id: String },
    #[error("artifact {artifact} has no rootfs")]
    MissingRootfs { artifact: String },
}
