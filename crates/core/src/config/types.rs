use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

use crate::converter::ConverterConfig;
use crate::pipeline::PipelineConfig;
use crate::retriever::RetrieverConfig;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub retriever: RetrieverConfig,
    #[serde(default)]
    pub converter: ConverterConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

/// Job registry configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobsConfig {
    /// How often finished jobs are checked for deleted outputs (0 disables).
    #[serde(default = "default_gc_interval")]
    pub gc_interval_secs: u64,
    /// Capacity of the job update broadcast channel.
    #[serde(default = "default_update_buffer")]
    pub update_buffer: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            gc_interval_secs: default_gc_interval(),
            update_buffer: default_update_buffer(),
        }
    }
}

fn default_gc_interval() -> u64 {
    300
}

fn default_update_buffer() -> usize {
    256
}
