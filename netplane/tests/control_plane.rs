//! End-to-end behavior of the control plane over the in-memory backends.

use std::net::IpAddr;
use std::sync::Arc;

use netplane::command::{CommandOutput, ScriptedRunner};
use netplane::dns::{NetworkSetupDns, ResolverCall};
use netplane::driver::MemoryDriver;
use netplane::filter::{iif_chain, port_element_key, port_vmap_names};
use netplane::{
    AddressFamily, Discovery, DnsManager, Link, NetworkContext, PortGroup, Protocol, Route,
    SecurityGroup,
};
use netplane_nl::nftables::{
    CmpOp, Expr, ImmediateData, NatType, SetElement, Table, TableFamily, Verdict, NFT_REG_1,
    NFT_REG_2,
};

const TABLE: &str = "netplane";

fn v4() -> Table {
    Table::new(TABLE, TableFamily::Ipv4)
}

fn gw() -> IpAddr {
    "192.168.1.1".parse().unwrap()
}

/// A host with eth0 as the default path and an unconfigured wg0
async fn host() -> (Arc<MemoryDriver>, Link) {
    let driver = Arc::new(MemoryDriver::new());
    let eth0 = driver.kernel.add_link("eth0").await;
    driver.kernel.add_link("wg0").await;
    driver
        .kernel
        .seed_route(Route::new("192.168.1.0/24".parse().unwrap()).with_link(eth0.clone()))
        .await;
    driver
        .kernel
        .seed_route(
            Route::new(AddressFamily::V4.any())
                .via(gw())
                .with_link(eth0.clone()),
        )
        .await;
    (driver, eth0)
}

async fn context(driver: &Arc<MemoryDriver>) -> NetworkContext {
    let discovery = Discovery::spawn(driver.clone());
    NetworkContext::new(&discovery).await.unwrap()
}

fn ssh_from(src: &str) -> SecurityGroup {
    SecurityGroup {
        src: Some(src.parse().unwrap()),
        dst: None,
        ports: vec![PortGroup::new(Protocol::Tcp, 22, 22)],
        deny: false,
    }
}

#[tokio::test]
async fn test_port_range_entries_match_verdict() {
    let (driver, _) = host().await;
    let ctx = context(&driver).await;
    let routes = ctx.new_route_manager().await.unwrap();
    let router = routes.new_filter_router().await.unwrap();

    let allow = SecurityGroup {
        src: Some("10.0.0.0/24".parse().unwrap()),
        ports: vec![PortGroup::new(Protocol::Tcp, 8000, 8015)],
        ..Default::default()
    };
    let deny = SecurityGroup {
        src: Some("10.9.0.0/24".parse().unwrap()),
        ports: vec![PortGroup::new(Protocol::Udp, 60000, 60003)],
        deny: true,
        ..Default::default()
    };
    router
        .set_security_groups(None, &[allow.clone(), deny.clone()])
        .unwrap();

    for (group, proto, verdict) in [(allow, 6u8, Verdict::Accept), (deny, 17u8, Verdict::Drop)] {
        let (map, _) = port_vmap_names(None, &group);
        let elements = driver.filter.elements(&v4(), &map).unwrap();
        let range = &group.ports[0];
        assert_eq!(elements.len(), (range.to_port - range.from_port + 1) as usize);
        for port in range.from_port..=range.to_port {
            assert!(elements.contains(&SetElement::with_verdict(
                port_element_key(proto, port),
                verdict.clone()
            )));
        }
    }
    ctx.clear().await;
}

#[tokio::test]
async fn test_repeated_groups_add_no_rules() {
    let (driver, _) = host().await;
    let ctx = context(&driver).await;
    let router = ctx
        .new_route_manager()
        .await
        .unwrap()
        .new_filter_router()
        .await
        .unwrap();

    router
        .set_security_groups(Some("wg0"), &[ssh_from("10.0.0.0/24")])
        .unwrap();
    let chain = iif_chain("wg0");
    let before = driver.filter.rules(&v4(), &chain).len();
    router
        .set_security_groups(Some("wg0"), &[ssh_from("10.0.0.0/24")])
        .unwrap();
    assert_eq!(driver.filter.rules(&v4(), &chain).len(), before);
}

#[tokio::test]
async fn test_delete_keeps_entries_of_other_group() {
    let (driver, _) = host().await;
    let ctx = context(&driver).await;
    let router = ctx
        .new_route_manager()
        .await
        .unwrap()
        .new_filter_router()
        .await
        .unwrap();

    let ssh = ssh_from("10.0.0.0/24");
    let web = SecurityGroup {
        ports: vec![PortGroup::new(Protocol::Tcp, 443, 443)],
        ..ssh.clone()
    };
    router
        .set_security_groups(Some("wg0"), &[ssh.clone(), web.clone()])
        .unwrap();

    let (map, _) = port_vmap_names(Some("wg0"), &ssh);
    assert_eq!(map, port_vmap_names(Some("wg0"), &web).0);
    assert_eq!(driver.filter.elements(&v4(), &map).unwrap().len(), 2);

    router.delete_security_groups(Some("wg0"), &[ssh]).unwrap();
    assert_eq!(
        driver.filter.elements(&v4(), &map).unwrap(),
        vec![SetElement::with_verdict(port_element_key(6, 443), Verdict::Accept)]
    );
    // the shared lookup rule survives while web still needs it
    assert_eq!(driver.filter.rules(&v4(), &iif_chain("wg0")).len(), 1);

    router.delete_security_groups(Some("wg0"), &[web]).unwrap();
    assert!(driver.filter.elements(&v4(), &map).is_none());
    assert!(driver.filter.rules(&v4(), &iif_chain("wg0")).is_empty());
}

#[tokio::test]
async fn test_port_forward_round_trip() {
    let (driver, _) = host().await;
    let ctx = context(&driver).await;
    let router = ctx
        .new_route_manager()
        .await
        .unwrap()
        .new_filter_router()
        .await
        .unwrap();

    let counts = || {
        ["nat-prerouting", "nat-postrouting", "forward"]
            .map(|chain| driver.filter.rules(&v4(), chain).len())
    };
    let baseline = counts();
    let dst: IpAddr = "203.0.113.10".parse().unwrap();
    let target: IpAddr = "10.0.0.5".parse().unwrap();

    router
        .forward_port_on_ip(dst, 443, 8443, target, Protocol::Tcp)
        .unwrap();
    assert_ne!(counts(), baseline);
    router
        .delete_forward_port_on_ip(dst, 443, 8443, target, Protocol::Tcp)
        .unwrap();
    assert_eq!(counts(), baseline);
}

#[tokio::test]
async fn test_port_forward_rewrites_to_target() {
    let (driver, _) = host().await;
    let ctx = context(&driver).await;
    let router = ctx
        .new_route_manager()
        .await
        .unwrap()
        .new_filter_router()
        .await
        .unwrap();

    router
        .forward_port(443, 8443, "10.0.0.5".parse().unwrap(), Protocol::Tcp)
        .unwrap();

    let pre = driver.filter.rules(&v4(), "nat-prerouting");
    assert_eq!(pre.len(), 1);
    let exprs = &pre[0].exprs;
    let cmp = |data: Vec<u8>| Expr::Cmp {
        op: CmpOp::Eq,
        sreg: NFT_REG_1,
        data,
    };
    assert!(exprs.contains(&cmp(vec![6])));
    assert!(exprs.contains(&cmp(443u16.to_be_bytes().to_vec())));
    assert!(exprs.contains(&Expr::Immediate {
        dreg: NFT_REG_1,
        data: ImmediateData::Value(vec![10, 0, 0, 5]),
    }));
    assert!(exprs.contains(&Expr::Immediate {
        dreg: NFT_REG_2,
        data: ImmediateData::Value(8443u16.to_be_bytes().to_vec()),
    }));
    assert!(matches!(
        exprs.last(),
        Some(Expr::Nat {
            nat_type: NatType::Dnat,
            ..
        })
    ));
}

#[tokio::test]
async fn test_wg0_group_uses_interface_chain() {
    let (driver, _) = host().await;
    let ctx = context(&driver).await;
    let router = ctx
        .new_route_manager()
        .await
        .unwrap()
        .new_filter_router()
        .await
        .unwrap();

    let input_before = driver.filter.rules(&v4(), "input").len();
    let forward_before = driver.filter.rules(&v4(), "forward").len();
    let group = ssh_from("10.0.0.0/24");
    router.set_security_groups(Some("wg0"), &[group.clone()]).unwrap();

    assert_eq!(driver.filter.rules(&v4(), "iif-wg0").len(), 1);
    assert_eq!(driver.filter.rules(&v4(), "input").len(), input_before);
    assert_eq!(driver.filter.rules(&v4(), "forward").len(), forward_before);

    let (map, _) = port_vmap_names(Some("wg0"), &group);
    assert_eq!(
        driver.filter.elements(&v4(), &map).unwrap(),
        vec![SetElement::with_verdict(port_element_key(6, 22), Verdict::Accept)]
    );
}

#[tokio::test]
async fn test_route_clear_restores_default() {
    let (driver, eth0) = host().await;
    let original = driver.kernel.routes().await;
    let ctx = context(&driver).await;
    assert_eq!(ctx.default_gateway(), Some(gw()));
    assert_eq!(ctx.default_interface(), Some(&eth0));

    let routes = ctx.new_route_manager().await.unwrap();
    let wg0 = routes
        .new_routable_interface("wg0", "10.8.0.2/24")
        .await
        .unwrap();
    assert_eq!(wg0.gateway(), "10.8.0.1".parse::<IpAddr>().unwrap());
    routes
        .add_external_route_to_ips(&["198.51.100.7".parse().unwrap()])
        .await
        .unwrap();
    wg0.make_default_route().await.unwrap();

    let installed = driver.kernel.routes().await;
    assert!(!installed.iter().any(|r| r.is_default()));
    for half in AddressFamily::V4.split_default() {
        assert!(installed
            .iter()
            .any(|r| r.destination == half && r.link_name() == Some("wg0")));
    }

    routes.clear().await;
    let restored = driver.kernel.routes().await;
    assert_eq!(restored.len(), original.len());
    for route in &original {
        assert!(restored.contains(route), "missing {:?}", route);
    }
    let default = restored.iter().find(|r| r.is_default()).unwrap();
    assert_eq!(default.gateway, Some(gw()));
    assert_eq!(default.link.as_ref(), Some(&eth0));
    assert!(!driver.kernel.link_state("wg0").await.unwrap().up);

    // a second clear through the context is a no-op
    ctx.clear().await;
    assert_eq!(driver.kernel.routes().await.len(), original.len());
}

#[tokio::test]
async fn test_linux_dns_reverted_on_clear() {
    let (driver, _) = host().await;
    let ctx = context(&driver).await;
    let routes = ctx.new_route_manager().await.unwrap();
    let wg0 = routes
        .new_routable_interface("wg0", "10.8.0.2/24")
        .await
        .unwrap();
    let dns = ctx.new_dns_manager().await.unwrap();

    dns.add_dns_servers(&["10.8.0.1".to_string()]).await.unwrap();
    dns.add_search_domains(&["corp.example".to_string()])
        .await
        .unwrap();
    ctx.clear().await;

    let ifindex = wg0.link().index;
    let calls = driver.resolver.calls();
    assert!(calls.contains(&ResolverCall::SetLinkDomains {
        ifindex,
        domains: vec![
            ("corp.example.".to_string(), false),
            (".".to_string(), true)
        ],
    }));
    assert_eq!(calls.last(), Some(&ResolverCall::RevertLink { ifindex }));
    assert_eq!(
        calls
            .iter()
            .filter(|c| matches!(c, ResolverCall::RevertLink { .. }))
            .count(),
        1
    );
}

#[tokio::test]
async fn test_networksetup_dns_restores_exact_lists() {
    let runner = Arc::new(ScriptedRunner::new());
    runner.respond(
        "networksetup -getdnsservers Wi-Fi",
        CommandOutput::ok("192.168.1.1\n1.1.1.1\n"),
    );
    runner.respond(
        "networksetup -getsearchdomains Wi-Fi",
        CommandOutput::ok("There aren't any Search Domains set on Wi-Fi.\n"),
    );
    let dns = NetworkSetupDns::new(runner.clone(), "Wi-Fi");

    dns.add_dns_servers(&["10.8.0.1".to_string()]).await.unwrap();
    dns.add_search_domains(&["corp.example".to_string()])
        .await
        .unwrap();
    dns.clear().await.unwrap();

    assert_eq!(
        runner.calls_matching("networksetup -setdnsservers"),
        vec![
            "networksetup -setdnsservers Wi-Fi 10.8.0.1",
            "networksetup -setdnsservers Wi-Fi 192.168.1.1 1.1.1.1",
        ]
    );
    assert_eq!(
        runner.calls_matching("networksetup -setsearchdomains"),
        vec![
            "networksetup -setsearchdomains Wi-Fi corp.example",
            "networksetup -setsearchdomains Wi-Fi Empty",
        ]
    );
}

#[tokio::test]
async fn test_context_clear_tears_down_filter() {
    let (driver, _) = host().await;
    let ctx = context(&driver).await;
    let router = ctx
        .new_route_manager()
        .await
        .unwrap()
        .new_filter_router()
        .await
        .unwrap();
    router
        .forward_traffic(
            "wg0",
            "10.8.0.0/24".parse().unwrap(),
            "eth0",
            "0.0.0.0/0".parse().unwrap(),
            true,
        )
        .unwrap();
    assert!(driver.filter.has_table(&v4()));

    ctx.clear().await;
    assert!(!driver.filter.has_table(&v4()));
    assert!(router.is_cleared());
    assert!(router
        .set_security_groups(None, &[ssh_from("10.0.0.0/24")])
        .is_err());
}
