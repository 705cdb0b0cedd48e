use crate::backup::pipeline::{CommandStage, Transform};
use bon::Builder;
use getset::Getters;

/// Public-key encryption to a single recipient with the external `gpg`.
#[derive(Clone, Debug, Builder, Getters)]
#[getset(get = "pub")]
pub struct GpgConfig {
    #[builder(into)]
    program: String,
    /// Key id, fingerprint or e-mail of the recipient key.
    #[builder(into)]
    recipient: String,
}

impl GpgConfig {
    pub fn stage(&self) -> Transform {
        // the recipient is its own argv entry, never spliced into a string
        let stage = CommandStage::new("gpg", &self.program)
            .args([
                "--batch",
                "--yes",
                "--quiet",
                "--trust-model",
                "always",
                "--encrypt",
                "--recipient",
            ])
            .arg(&self.recipient)
            .args(["--output", "-"]);
        Transform::Command(stage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpg_arguments() {
        let config = GpgConfig::builder()
            .program("gpg")
            .recipient("Ops Team <ops@example.com>")
            .build();
        match config.stage() {
            Transform::Command(stage) => {
                let args: Vec<_> = stage
                    .arguments()
                    .iter()
                    .map(|a| a.to_string_lossy().into_owned())
                    .collect();
                let recipient_at = args.iter().position(|a| a == "--recipient").unwrap();
                assert_eq!(args[recipient_at + 1], "Ops Team <ops@example.com>");
                assert_eq!(&args[args.len() - 2..], ["--output", "-"]);
            }
            t => panic!("Expected command stage, got {t:?}"),
        }
    }
}
