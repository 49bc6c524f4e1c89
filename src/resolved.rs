use std::collections::BTreeMap;

use rattler_conda_types::RepoDataRecord;

use crate::channel::MirrorChannel;

/// The packages of a single solve, keyed by channel name, then platform, then file name
#[derive(Debug, Default, Clone)]
pub struct ResolvedPackages {
    channels: BTreeMap<String, BTreeMap<String, BTreeMap<String, RepoDataRecord>>>,
}

impl ResolvedPackages {
    /// Sorts solved records into their channel and platform. A record belongs to the channel with
    /// the longest base url that prefixes the record's url, and to the platform named by the
    /// directory the file lives in.
    pub fn from_records(
        records: impl IntoIterator<Item = RepoDataRecord>,
        channels: &[MirrorChannel],
    ) -> ResolvedPackages {
        let mut resolved = ResolvedPackages::default();
        for record in records {
            let url = record.url.as_str();
            let channel_name = channels
                .iter()
                .filter(|c| url.starts_with(c.base_url()))
                .max_by_key(|c| c.base_url().len())
                .map(|c| c.name.clone())
                .unwrap_or_else(|| record.channel.clone());
            let platform = platform_of(&record);
            resolved.insert(channel_name, platform, record);
        }
        resolved
    }

    pub fn insert(&mut self, channel: String, platform: String, record: RepoDataRecord) {
        self.channels
            .entry(channel)
            .or_default()
            .entry(platform)
            .or_default()
            .insert(record.file_name.clone(), record);
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn platforms(&self, channel: &str) -> impl Iterator<Item = &str> {
        self.channels
            .get(channel)
            .into_iter()
            .flat_map(|platforms| platforms.keys().map(String::as_str))
    }

    /// The file names resolved for a (channel, platform) pair, in sorted order
    pub fn file_names(&self, channel: &str, platform: &str) -> Vec<&str> {
        self.records(channel, platform)
            .map(|record| record.file_name.as_str())
            .collect()
    }

    pub fn records(&self, channel: &str, platform: &str) -> impl Iterator<Item = &RepoDataRecord> {
        self.channels
            .get(channel)
            .and_then(|platforms| platforms.get(platform))
            .into_iter()
            .flat_map(|files| files.values())
    }

    /// Iterates over every (channel, platform) pair together with its records
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, Vec<&RepoDataRecord>)> {
        self.channels.iter().flat_map(|(channel, platforms)| {
            platforms.iter().map(move |(platform, files)| {
                (channel.as_str(), platform.as_str(), files.values().collect())
            })
        })
    }
}

fn platform_of(record: &RepoDataRecord) -> String {
    let from_url = record
        .url
        .path_segments()
        .and_then(|segments| segments.rev().nth(1))
        .filter(|segment| !segment.is_empty());
    match from_url {
        Some(platform) => platform.to_string(),
        None => record.package_record.subdir.clone(),
    }
}
