//! Synthetic channels served by a mock HTTP server

use md5::Md5;
use rattler_conda_types::{ChannelConfig, PackageRecord, RepoDataRecord};
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::channel::MirrorChannel;

/// A package of a synthetic channel. `served` and `status` describe what the server hands out for
/// the package file, which may differ from what the repodata promises.
pub struct TestPackage {
    pub name: String,
    pub version: String,
    pub depends: Vec<String>,
    pub contents: Vec<u8>,
    pub served: Vec<u8>,
    pub status: usize,
}

impl TestPackage {
    pub fn new(name: &str, version: &str, depends: &[&str], contents: &[u8]) -> TestPackage {
        TestPackage {
            name: name.to_string(),
            version: version.to_string(),
            depends: depends.iter().map(|d| d.to_string()).collect(),
            contents: contents.to_vec(),
            served: contents.to_vec(),
            status: 200,
        }
    }

    pub fn file_name(&self) -> String {
        format!("{}-{}-0.tar.bz2", self.name, self.version)
    }
}

pub fn repodata_json(subdir: &str, packages: &[TestPackage]) -> String {
    let packages: serde_json::Map<String, serde_json::Value> = packages
        .iter()
        .map(|package| {
            (
                package.file_name(),
                json!({
                    "name": package.name,
                    "version": package.version,
                    "build": "0",
                    "build_number": 0,
                    "depends": package.depends,
                    "subdir": subdir,
                    "size": package.contents.len(),
                    "sha256": format!("{:x}", Sha256::digest(&package.contents)),
                    "md5": format!("{:x}", Md5::digest(&package.contents)),
                }),
            )
        })
        .collect();

    json!({
        "info": { "subdir": subdir },
        "packages": packages,
        "packages.conda": {},
        "repodata_version": 1,
    })
    .to_string()
}

/// Serves `packages` as the `subdir` of `channel`, without compressed repodata variants
pub async fn serve_channel(
    server: &mut mockito::ServerGuard,
    channel: &str,
    subdir: &str,
    packages: &[TestPackage],
) {
    for variant in ["repodata.json.zst", "repodata.json.bz2"] {
        server
            .mock("HEAD", format!("/{channel}/{subdir}/{variant}").as_str())
            .with_status(404)
            .create_async()
            .await;
    }
    server
        .mock("GET", format!("/{channel}/{subdir}/repodata.json").as_str())
        .with_body(repodata_json(subdir, packages))
        .create_async()
        .await;
    for package in packages {
        server
            .mock(
                "GET",
                format!("/{channel}/{subdir}/{}", package.file_name()).as_str(),
            )
            .with_status(package.status)
            .with_body(&package.served)
            .create_async()
            .await;
    }
}

pub fn test_client() -> ClientWithMiddleware {
    reqwest_middleware::ClientBuilder::new(reqwest::Client::new()).build()
}

pub fn test_channel(server: &mockito::ServerGuard, name: &str) -> MirrorChannel {
    MirrorChannel::parse(&format!("{}/{name}", server.url()), &ChannelConfig::default()).unwrap()
}

/// A record for the package file at `url`, e.g. `.../noarch/traitlets-5.9.0-0.conda`
pub fn record(url: &str) -> RepoDataRecord {
    let url = Url::parse(url).unwrap();
    let mut segments = url.path_segments().unwrap().rev();
    let file_name = segments.next().unwrap().to_string();
    let subdir = segments.next().unwrap().to_string();
    let name = file_name.split('-').next().unwrap().to_string();

    let package_record: PackageRecord = serde_json::from_value(json!({
        "name": name,
        "version": "1.0",
        "build": "0",
        "build_number": 0,
        "subdir": subdir,
    }))
    .unwrap();

    RepoDataRecord {
        package_record,
        file_name,
        url,
        channel: String::new(),
    }
}
