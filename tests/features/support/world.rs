//! Test world for Cucumber scenarios

use std::fmt;
use std::sync::Arc;

use cucumber::World;
use tempfile::TempDir;
use wiremock::MockServer;

use fleet_certs::config::IssuanceSource;
use fleet_certs::services::{
    CertificatePipeline, OperatorPrompt, PipelineOptions, PipelineReport, RenewalTarget,
};
use fleet_certs::utils::error::CertError;

use crate::common::{ca_config, test_config, FakeProxy, ScriptedPrompt, TestCa};

/// Test world that maintains state across scenario steps
#[derive(Default, World)]
pub struct CertWorld {
    /// Mock CA, when the scenario has one
    pub server: Option<MockServer>,
    pub ca: Option<Arc<TestCa>>,
    pub prompt: Option<Arc<ScriptedPrompt>>,
    pub proxy: Arc<FakeProxy>,

    /// Stores, locks and proxy directories for this scenario
    pub root: Option<TempDir>,

    /// Outcome of the last run
    pub report: Option<PipelineReport>,
    pub error: Option<CertError>,
}

impl fmt::Debug for CertWorld {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertWorld")
            .field("server", &self.server.as_ref().map(|s| s.uri()))
            .field("report", &self.report)
            .field("error", &self.error)
            .finish()
    }
}

impl CertWorld {
    pub fn root_path(&mut self) -> std::path::PathBuf {
        self.root
            .get_or_insert_with(|| tempfile::tempdir().unwrap())
            .path()
            .to_path_buf()
    }

    pub fn ca(&mut self) -> Arc<TestCa> {
        self.ca.get_or_insert_with(TestCa::new).clone()
    }

    /// Run the single-identity path and record its outcome
    pub async fn run(&mut self, source: IssuanceSource, target: RenewalTarget) {
        let root = self.root_path();
        let config = match self.server {
            Some(ref server) => ca_config(&root, &server.uri()),
            None => test_config(&root),
        };

        let prompt: Arc<dyn OperatorPrompt> = match self.prompt {
            Some(ref prompt) => prompt.clone(),
            None => Arc::new(ScriptedPrompt::absent()),
        };
        let options = PipelineOptions {
            source,
            fallback_to_self_signed: false,
            reload: true,
        };
        let pipeline = CertificatePipeline::new(&config, options, prompt)
            .unwrap()
            .with_proxy_controller(self.proxy.clone());

        match pipeline.run(&target).await {
            Ok(report) => {
                self.report = Some(report);
                self.error = None;
            }
            Err(e) => {
                self.report = None;
                self.error = Some(e);
            }
        }
    }
}
