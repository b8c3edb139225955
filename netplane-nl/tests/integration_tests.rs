//! Integration tests against the running kernel.
//!
//! These tests require root privileges (or CAP_NET_ADMIN) and are ignored
//! by default. Run with: sudo -E cargo test -p netplane-nl -- --ignored

#![cfg(target_os = "linux")]

use netplane_nl::nftables::{
    get_rules, get_set_elements, ifname_bytes, priority, BaseChain, Batch, Chain, ChainType,
    DataType, Expr, Hook, MetaKey, Rule, Set, SetElement, Table, TableFamily, Verdict,
    NFT_REG_1, NFT_REG_VERDICT,
};
use netplane_nl::rtnl;

const TABLE_NAME: &str = "netplane_nl_test";

fn table() -> Table {
    Table::new(TABLE_NAME, TableFamily::Ipv4)
}

fn cleanup() {
    let mut batch = Batch::new();
    batch.del_table(&table()).unwrap();
    let _ = batch.commit();
}

#[test]
#[ignore]
fn test_routes_can_be_listed() {
    let routes = rtnl::list_routes(libc::AF_INET as u8).expect("failed to dump routes");
    // Every host with networking has at least one main-table route.
    assert!(!routes.is_empty());
}

#[test]
#[ignore]
fn test_loopback_has_an_address() {
    let lo = rtnl::if_nametoindex("lo").unwrap();
    let addrs = rtnl::list_addresses(libc::AF_INET as u8).unwrap();
    assert!(addrs
        .iter()
        .any(|a| a.index == lo && a.address.is_loopback()));
}

#[test]
#[ignore]
fn test_rule_and_map_lifecycle() {
    cleanup();

    let input = Chain::base(
        table(),
        "input",
        BaseChain {
            hook: Hook::Input,
            priority: priority::FILTER,
            chain_type: ChainType::Filter,
            policy: Verdict::Accept,
        },
    );
    let iifs = Set::verdict_map(table(), "iifs", DataType::IFNAME);
    let rule = Rule::new(
        table(),
        "input",
        vec![
            Expr::Meta {
                key: MetaKey::IifName,
                dreg: NFT_REG_1,
            },
            Expr::Lookup {
                set: "iifs".into(),
                sreg: NFT_REG_1,
                dreg: Some(NFT_REG_VERDICT),
                invert: false,
            },
        ],
    );

    let mut batch = Batch::new();
    batch.add_table(&table()).unwrap();
    batch.add_chain(&input).unwrap();
    batch.add_set(&iifs).unwrap();
    batch.add_rule(&rule).unwrap();
    batch
        .add_elements(
            &iifs,
            &[SetElement::with_verdict(ifname_bytes("lo"), Verdict::Accept)],
        )
        .unwrap();
    batch.commit().expect("failed to commit batch");

    let rules = get_rules(&table(), "input").unwrap();
    assert_eq!(rules.len(), 1);
    assert!(rules[0].handle > 0);
    assert!(rules[0].same_as(&rule));

    let elements = get_set_elements(&iifs).unwrap();
    assert_eq!(elements.len(), 1);
    assert_eq!(elements[0].verdict, Some(Verdict::Accept));

    let mut batch = Batch::new();
    batch.del_rule(&rules[0]).unwrap();
    batch.commit().unwrap();
    assert!(get_rules(&table(), "input").unwrap().is_empty());

    cleanup();
}
