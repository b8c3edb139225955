//! macOS DNS override through `networksetup`.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{parse_servers, DnsManager};
use crate::command::CommandRunner;
use crate::error::Result;

/// Settings captured before the first override
#[derive(Debug, Default)]
struct Saved {
    servers: Option<Vec<String>>,
    domains: Option<Vec<String>>,
}

/// Overrides DNS on one network service ("Wi-Fi", "Ethernet") and puts
/// the original lists back on clear.
pub struct NetworkSetupDns {
    runner: Arc<dyn CommandRunner>,
    service: String,
    saved: Mutex<Saved>,
}

/// Parse `-getdnsservers`/`-getsearchdomains` output. An unset list is
/// reported as a sentence ("There aren't any DNS Servers set on Wi-Fi.").
fn parse_list(output: &str) -> Vec<String> {
    if output.contains("aren't any") {
        return Vec::new();
    }
    output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.contains(' '))
        .map(str::to_string)
        .collect()
}

impl NetworkSetupDns {
    pub fn new(runner: Arc<dyn CommandRunner>, service: impl Into<String>) -> Self {
        Self {
            runner,
            service: service.into(),
            saved: Mutex::new(Saved::default()),
        }
    }

    async fn capture(&self, flag: &str) -> Result<Vec<String>> {
        let stdout = self
            .runner
            .run_checked("networksetup", &[flag, &self.service])
            .await?;
        Ok(parse_list(&stdout))
    }

    async fn apply(&self, flag: &str, values: &[String]) {
        let mut args = vec![flag, self.service.as_str()];
        if values.is_empty() {
            args.push("Empty");
        } else {
            args.extend(values.iter().map(String::as_str));
        }
        if let Err(e) = self.runner.run_checked("networksetup", &args).await {
            log::warn!("networksetup {} on {} failed: {}", flag, self.service, e);
        }
    }

    async fn flush_cache(&self) {
        if let Err(e) = self.runner.run_checked("dscacheutil", &["-flushcache"]).await {
            log::warn!("Failed to flush DNS cache: {}", e);
        }
        if let Err(e) = self
            .runner
            .run_checked("killall", &["-HUP", "mDNSResponder"])
            .await
        {
            log::warn!("Failed to signal mDNSResponder: {}", e);
        }
    }
}

#[async_trait]
impl DnsManager for NetworkSetupDns {
    async fn add_dns_servers(&self, servers: &[String]) -> Result<()> {
        let servers: Vec<String> = parse_servers(servers)
            .into_iter()
            .map(|a| a.to_string())
            .collect();
        if servers.is_empty() {
            return Ok(());
        }

        let mut saved = self.saved.lock().await;
        if saved.servers.is_none() {
            saved.servers = Some(self.capture("-getdnsservers").await?);
        }
        self.apply("-setdnsservers", &servers).await;
        self.flush_cache().await;
        log::info!("DNS servers on {} set to {}", self.service, servers.join(", "));
        Ok(())
    }

    async fn add_search_domains(&self, domains: &[String]) -> Result<()> {
        let domains: Vec<String> = domains
            .iter()
            .map(|d| d.trim().trim_end_matches('.').to_string())
            .filter(|d| !d.is_empty())
            .collect();
        if domains.is_empty() {
            return Ok(());
        }

        let mut saved = self.saved.lock().await;
        if saved.domains.is_none() {
            saved.domains = Some(self.capture("-getsearchdomains").await?);
        }
        self.apply("-setsearchdomains", &domains).await;
        Ok(())
    }

    async fn clear(&self) -> Result<()> {
        let mut saved = self.saved.lock().await;
        let servers = saved.servers.take();
        let domains = saved.domains.take();
        if let Some(servers) = &servers {
            self.apply("-setdnsservers", servers).await;
        }
        if let Some(domains) = &domains {
            self.apply("-setsearchdomains", domains).await;
        }
        if servers.is_some() {
            self.flush_cache().await;
            log::info!("DNS settings on {} restored", self.service);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, ScriptedRunner};

    fn dns(runner: &Arc<ScriptedRunner>) -> NetworkSetupDns {
        NetworkSetupDns::new(runner.clone(), "Wi-Fi")
    }

    #[test]
    fn test_parse_list() {
        assert!(parse_list("There aren't any DNS Servers set on Wi-Fi.\n").is_empty());
        assert_eq!(parse_list("1.1.1.1\n8.8.8.8\n"), vec!["1.1.1.1", "8.8.8.8"]);
    }

    #[tokio::test]
    async fn test_set_then_restore_captured_servers() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "networksetup -getdnsservers",
            CommandOutput::ok("192.168.1.1\n"),
        );
        let dns = dns(&runner);

        dns.add_dns_servers(&["10.8.0.1".into(), "bogus".into()])
            .await
            .unwrap();
        dns.add_dns_servers(&["10.8.0.2".into()]).await.unwrap();
        assert_eq!(runner.calls_matching("networksetup -getdnsservers").len(), 1);
        assert_eq!(
            runner.calls_matching("networksetup -setdnsservers"),
            vec![
                "networksetup -setdnsservers Wi-Fi 10.8.0.1",
                "networksetup -setdnsservers Wi-Fi 10.8.0.2"
            ]
        );
        assert_eq!(runner.calls_matching("dscacheutil -flushcache").len(), 2);
        assert_eq!(runner.calls_matching("killall -HUP mDNSResponder").len(), 2);

        dns.clear().await.unwrap();
        assert_eq!(
            runner.calls_matching("networksetup -setdnsservers").last().unwrap(),
            "networksetup -setdnsservers Wi-Fi 192.168.1.1"
        );

        // second clear has nothing left to restore
        let before = runner.calls().len();
        dns.clear().await.unwrap();
        assert_eq!(runner.calls().len(), before);
    }

    #[tokio::test]
    async fn test_restore_empty_lists() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "networksetup -getsearchdomains",
            CommandOutput::ok("There aren't any Search Domains set on Wi-Fi.\n"),
        );
        let dns = dns(&runner);
        dns.add_search_domains(&["corp.example.".into()]).await.unwrap();
        assert_eq!(
            runner.calls_matching("networksetup -setsearchdomains"),
            vec!["networksetup -setsearchdomains Wi-Fi corp.example"]
        );

        dns.clear().await.unwrap();
        assert_eq!(
            runner.calls_matching("networksetup -setsearchdomains").last().unwrap(),
            "networksetup -setsearchdomains Wi-Fi Empty"
        );
    }

    #[tokio::test]
    async fn test_capture_failure_changes_nothing() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond(
            "networksetup -getdnsservers",
            CommandOutput::failed("** Error: unknown service"),
        );
        let dns = dns(&runner);
        assert!(dns.add_dns_servers(&["10.8.0.1".into()]).await.is_err());
        assert!(runner.calls_matching("networksetup -setdnsservers").is_empty());
    }
}
