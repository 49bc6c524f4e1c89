use rattler_conda_types::{Channel, ChannelConfig, ParseChannelError, Platform};
use thiserror::Error;

/// The channel used when neither the command line nor the environment file names one
pub const DEFAULT_CHANNEL: &str = "conda-forge";

/// Where conda's `defaults` channels live
const DEFAULTS_BASE_URL: &str = "https://repo.anaconda.com/pkgs";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("invalid channel `{0}`")]
    Invalid(String, #[source] ParseChannelError),
    #[error("channels {first} and {second} would both be mirrored into `{directory}`")]
    SameDirectory {
        directory: String,
        first: String,
        second: String,
    },
}

/// A channel to mirror from, together with the name it was requested under. The name decides the
/// subdirectory of the target directory the channel's packages end up in.
#[derive(Debug, Clone)]
pub struct MirrorChannel {
    pub name: String,
    pub channel: Channel,
}

impl MirrorChannel {
    pub fn parse(name: &str, config: &ChannelConfig) -> Result<MirrorChannel, ChannelError> {
        let name = name.trim_end_matches('/');
        let source = if is_default_channel(name) {
            format!("{DEFAULTS_BASE_URL}/{name}/")
        } else {
            name.to_string()
        };

        let channel = Channel::from_str(&source, config)
            .map_err(|e| ChannelError::Invalid(name.to_string(), e))?;

        Ok(MirrorChannel {
            name: directory_name(name),
            channel,
        })
    }

    /// The url prefix shared by every package of this channel
    pub fn base_url(&self) -> &str {
        self.channel.base_url.as_str()
    }
}

/// Builds the ordered, deduplicated set of channels to resolve against. `defaults` is expanded to
/// the individual default channels, and an empty input yields [`DEFAULT_CHANNEL`]. Distinct
/// channels sharing a target directory are rejected.
pub fn channel_set<'a>(
    names: impl IntoIterator<Item = &'a str>,
    platforms: &[Platform],
) -> Result<Vec<MirrorChannel>, ChannelError> {
    let config = ChannelConfig::default();

    let mut expanded = Vec::new();
    for name in names {
        if name == "defaults" {
            expanded.extend(["main", "r"]);
            if platforms.iter().any(|p| p.is_windows()) {
                expanded.push("msys2");
            }
        } else {
            expanded.push(name);
        }
    }
    if expanded.is_empty() {
        expanded.push(DEFAULT_CHANNEL);
    }

    let mut channels: Vec<MirrorChannel> = Vec::with_capacity(expanded.len());
    for name in expanded {
        let channel = MirrorChannel::parse(name, &config)?;
        if channels.iter().any(|c| c.base_url() == channel.base_url()) {
            continue;
        }
        if let Some(other) = channels.iter().find(|c| c.name == channel.name) {
            return Err(ChannelError::SameDirectory {
                directory: channel.name.clone(),
                first: other.base_url().to_string(),
                second: channel.base_url().to_string(),
            });
        }
        channels.push(channel);
    }

    Ok(channels)
}

fn is_default_channel(name: &str) -> bool {
    matches!(name, "main" | "r" | "msys2")
}

/// Channel urls become nested directories named after their path, e.g.
/// `https://example.com/conda/internal` is stored below `conda/internal`
fn directory_name(name: &str) -> String {
    match url::Url::parse(name) {
        Ok(url) if url.has_host() => {
            let path = url.path().trim_matches('/');
            if path.is_empty() {
                url.host_str().unwrap_or(name).to_string()
            } else {
                path.to_string()
            }
        }
        _ => name.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn names(channels: &[MirrorChannel]) -> Vec<&str> {
        channels.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_empty_set_uses_default_channel() {
        let channels = channel_set([], &[Platform::Linux64]).unwrap();
        assert_eq!(names(&channels), vec!["conda-forge"]);
        assert_eq!(
            channels[0].base_url(),
            "https://conda.anaconda.org/conda-forge/"
        );
    }

    #[test]
    fn test_order_is_kept_and_duplicates_removed() {
        let channels = channel_set(
            ["bioconda", "conda-forge", "bioconda/", "conda-forge"],
            &[Platform::Linux64],
        )
        .unwrap();
        assert_eq!(names(&channels), vec!["bioconda", "conda-forge"]);
    }

    #[test]
    fn test_default_channels() {
        let channels = channel_set(["main"], &[Platform::Linux64]).unwrap();
        assert_eq!(names(&channels), vec!["main"]);
        assert_eq!(channels[0].base_url(), "https://repo.anaconda.com/pkgs/main/");

        let channels = channel_set(["defaults"], &[Platform::Linux64]).unwrap();
        assert_eq!(names(&channels), vec!["main", "r"]);

        let channels = channel_set(["defaults"], &[Platform::Linux64, Platform::Win64]).unwrap();
        assert_eq!(names(&channels), vec!["main", "r", "msys2"]);
    }

    #[test]
    fn test_url_channels_use_their_path() {
        let channels = channel_set(
            ["https://example.com/conda/internal/"],
            &[Platform::Linux64],
        )
        .unwrap();
        assert_eq!(names(&channels), vec!["conda/internal"]);
        assert_eq!(
            channels[0].base_url(),
            "https://example.com/conda/internal/"
        );
    }

    #[test]
    fn test_channels_sharing_a_directory_are_rejected() {
        let error = channel_set(
            ["conda-forge", "https://prefix.dev/conda-forge"],
            &[Platform::Linux64],
        )
        .unwrap_err();

        let ChannelError::SameDirectory {
            directory,
            first,
            second,
        } = error
        else {
            panic!("expected a directory clash, got {error:?}");
        };
        assert_eq!(directory, "conda-forge");
        assert_eq!(first, "https://conda.anaconda.org/conda-forge/");
        assert_eq!(second, "https://prefix.dev/conda-forge/");
    }
}
