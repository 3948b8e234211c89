//! Stack map codec tests
//!
//! Encode/decode behaviour, call-site lookup and GC root visitation over
//! synthetic frames.

use otter_aot_stackmap::{
    CallSiteInfo, DeoptEntry, DeoptValue, FrameContext, Location, RootVisitor, SlotMemory,
    StackMapBuilder, StackMapEntry, StackMapParser, Triple, encode, visit_roots,
};
use proptest::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};

const FP: u16 = 6;
const SP: u16 = 7;

#[derive(Default)]
struct FakeStack {
    words: FxHashMap<usize, u64>,
}

impl FakeStack {
    fn set(&mut self, address: usize, value: u64) {
        self.words.insert(address, value);
    }
}

impl SlotMemory for FakeStack {
    fn read_word(&self, address: usize) -> Option<u64> {
        Some(self.words.get(&address).copied().unwrap_or(0))
    }
}

#[derive(Default)]
struct Recorder {
    roots: Vec<usize>,
    ranges: Vec<(usize, usize)>,
    derived: Vec<(usize, usize, u64)>,
}

impl RootVisitor for Recorder {
    fn visit_root(&mut self, slot: usize) {
        self.roots.push(slot);
    }

    fn visit_range(&mut self, start: usize, end: usize) {
        self.ranges.push((start, end));
    }

    fn visit_derived(&mut self, base_slot: usize, derived_slot: usize, base_value: u64) {
        self.derived.push((base_slot, derived_slot, base_value));
    }
}

fn two_site_table() -> Vec<u8> {
    let mut builder = StackMapBuilder::new();
    builder
        .push(CallSiteInfo::new(0x40).with_deopt(3, DeoptValue::Constant(42)))
        .push(CallSiteInfo::new(0x10).with_root(Location::new(FP, -40)));
    builder.build().unwrap()
}

#[test]
fn test_two_call_site_scenario() {
    let section = two_site_table();
    let parser = StackMapParser::new(&section).unwrap();
    parser.validate().unwrap();

    let site = parser.lookup(0x10).unwrap().unwrap();
    assert!(site.deopts.is_empty());
    assert_eq!(site.stack_map, vec![StackMapEntry::plain(Location::new(FP, -40))]);

    let fp = 0x7000usize;
    let mut stack = FakeStack::default();
    stack.set(fp - 40, 0xdead_0000);
    let ctx = FrameContext::new(Triple::X86_64, fp, fp - 0x80);
    let mut recorder = Recorder::default();
    let mut seen = FxHashSet::default();
    let count = visit_roots(&site.stack_map, &ctx, &stack, &mut recorder, &mut seen).unwrap();
    assert_eq!(count, 1);
    assert_eq!(recorder.roots, vec![fp - 40]);

    let site = parser.lookup(0x40).unwrap().unwrap();
    assert!(site.stack_map.is_empty());
    assert_eq!(site.deopts, vec![DeoptEntry::new(3, DeoptValue::Constant(42))]);
    let header = parser.find(0x40).unwrap();
    assert_eq!(
        parser.deopt_value(&header, 3).unwrap(),
        Some(DeoptValue::Constant(42))
    );

    assert_eq!(parser.lookup(0x20).unwrap(), None);
}

#[test]
fn test_every_site_found_and_gaps_missing() {
    let sites: Vec<CallSiteInfo> = (1..=200u32)
        .map(|i| CallSiteInfo::new(i * 8).with_root(Location::new(SP, i as i32)))
        .collect();
    let section = encode(&sites).unwrap();
    let parser = StackMapParser::new(&section).unwrap();
    assert_eq!(parser.callsite_count(), 200);
    for site in &sites {
        assert_eq!(parser.lookup(site.pc_offset).unwrap().as_ref(), Some(site));
        assert!(parser.find(site.pc_offset + 1).is_none());
        assert!(parser.find(site.pc_offset - 1).is_none());
    }
    assert!(parser.find(0).is_none());
    assert!(parser.find(201 * 8).is_none());
}

#[test]
fn test_empty_table() {
    let section = encode(&[]).unwrap();
    let parser = StackMapParser::new(&section).unwrap();
    assert_eq!(parser.callsite_count(), 0);
    assert!(parser.find(0).is_none());
    assert!(parser.decode_all().unwrap().is_empty());
}

#[test]
fn test_base_reported_once_per_walk() {
    let fp = 0x8000usize;
    let base = Location::new(FP, -8);
    let entries = [
        StackMapEntry::derived(base, Location::new(FP, -16)),
        StackMapEntry::derived(base, Location::new(FP, -24)),
        StackMapEntry::plain(base),
    ];
    let mut stack = FakeStack::default();
    stack.set(fp - 8, 0x1000);
    stack.set(fp - 16, 0x1010);
    stack.set(fp - 24, 0x1020);

    let ctx = FrameContext::new(Triple::X86_64, fp, fp - 64);
    let mut recorder = Recorder::default();
    let mut seen = FxHashSet::default();
    visit_roots(&entries, &ctx, &stack, &mut recorder, &mut seen).unwrap();

    assert_eq!(recorder.roots, vec![fp - 8]);
    assert_eq!(
        recorder.derived,
        vec![(fp - 8, fp - 16, 0x1000), (fp - 8, fp - 24, 0x1000)]
    );
    assert!(recorder.ranges.is_empty());

    // the same set carried across frames keeps deduplicating
    let again = visit_roots(&entries, &ctx, &stack, &mut recorder, &mut seen).unwrap();
    assert_eq!(again, 0);
}

#[test]
fn test_zero_base_falls_back_to_derived() {
    let fp = 0x8000usize;
    let entries = [StackMapEntry::derived(
        Location::new(FP, -8),
        Location::new(FP, -16),
    )];
    let mut stack = FakeStack::default();
    stack.set(fp - 16, 0x2000);

    let ctx = FrameContext::new(Triple::X86_64, fp, fp - 64);
    let mut recorder = Recorder::default();
    let mut seen = FxHashSet::default();
    visit_roots(&entries, &ctx, &stack, &mut recorder, &mut seen).unwrap();

    assert_eq!(recorder.roots, vec![fp - 16]);
    assert!(recorder.derived.is_empty());
}

#[test]
fn test_null_slots_are_not_roots() {
    let fp = 0x8000usize;
    let entries = [
        StackMapEntry::plain(Location::new(FP, -8)),
        StackMapEntry::derived(Location::new(FP, -16), Location::new(FP, -24)),
    ];
    let stack = FakeStack::default();
    let ctx = FrameContext::new(Triple::X86_64, fp, fp - 64);
    let mut recorder = Recorder::default();
    let mut seen = FxHashSet::default();
    let count = visit_roots(&entries, &ctx, &stack, &mut recorder, &mut seen).unwrap();
    assert_eq!(count, 0);
    assert!(recorder.roots.is_empty());
    assert!(recorder.derived.is_empty());
}

fn arb_location() -> impl Strategy<Value = Location> {
    (0u16..64, any::<i32>()).prop_map(|(reg, offset)| Location::new(reg, offset))
}

fn arb_entry() -> impl Strategy<Value = StackMapEntry> {
    prop_oneof![
        arb_location().prop_map(StackMapEntry::plain),
        (arb_location(), arb_location()).prop_map(|(b, d)| StackMapEntry::derived(b, d)),
    ]
}

fn arb_deopt_value() -> impl Strategy<Value = DeoptValue> {
    prop_oneof![
        any::<i32>().prop_map(DeoptValue::Constant),
        any::<i64>().prop_map(DeoptValue::LargeConstant),
        arb_location().prop_map(DeoptValue::Indirect),
    ]
}

fn arb_callsites() -> impl Strategy<Value = Vec<CallSiteInfo>> {
    proptest::collection::btree_map(
        any::<u32>(),
        (
            proptest::collection::vec(arb_entry(), 0..8),
            proptest::collection::btree_map(any::<i32>(), arb_deopt_value(), 0..6),
        ),
        0..24,
    )
    .prop_map(|sites| {
        sites
            .into_iter()
            .map(|(pc_offset, (stack_map, deopts))| CallSiteInfo {
                pc_offset,
                stack_map,
                deopts: deopts
                    .into_iter()
                    .map(|(id, value)| DeoptEntry::new(id, value))
                    .collect(),
            })
            .collect()
    })
}

proptest! {
    #[test]
    fn test_decode_inverts_encode(sites in arb_callsites()) {
        let section = encode(&sites).unwrap();
        let parser = StackMapParser::new(&section).unwrap();
        prop_assert!(parser.validate().is_ok());
        prop_assert_eq!(parser.decode_all().unwrap(), sites.clone());
        for site in &sites {
            let looked_up = parser.lookup(site.pc_offset).unwrap();
            prop_assert_eq!(looked_up.as_ref(), Some(site));
        }
    }
}
