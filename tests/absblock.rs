//! Abstract-block properties: concretization monotonicity, lift-sample
//! round trips, subsumption soundness, sampler determinism, and the
//! canonical serialization.

mod utils;

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::SeedableRng;

use anica::abstraction::{AbstractBlock, Sampler};
use anica::iwho::parse::parse_block;

use utils::{demo_fm, init};

#[test]
fn concretization_monotonicity() {
    init();
    let fm = demo_fm();
    let bb = parse_block(fm.ctx(), "add rax, rbx\nimul rcx, rax").unwrap();
    let fine = AbstractBlock::from_concrete(&fm, &bb);

    // coarsen a copy by a handful of expansions
    let mut coarse = fine.clone();
    for _ in 0..6 {
        let expansions = coarse.possible_expansions(&fm);
        match expansions.into_iter().next() {
            Some((expansion, _)) => coarse.apply_expansion(&expansion),
            None => break,
        }
    }
    assert!(coarse.subsumes(&fine));

    let sampler = Sampler::new(&fm, &fine, &HashSet::new()).unwrap();
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..1000 {
        let sample = sampler.sample(&mut rng).unwrap();
        assert!(fine.contains_concrete(&fm, &sample));
        assert!(
            coarse.contains_concrete(&fm, &sample),
            "a coarser block must contain every member of a finer one"
        );
    }
}

#[test]
fn lift_sample_round_trip() {
    init();
    let fm = demo_fm();
    for asm in &[
        "add rax, rbx",
        "add rax, 0x2a\nsub rbx, rax",
        "add qword ptr [rbp + 0x40], rax\nmov rcx, qword ptr [rbp + 0x40]",
        "imul rax, rbx\nxor rax, rax\nadc rcx, rdx",
    ] {
        let bb = parse_block(fm.ctx(), asm).unwrap();
        let lifted = AbstractBlock::from_concrete(&fm, &bb);
        let sampler = Sampler::new(&fm, &lifted, &HashSet::new()).unwrap();
        let mut rng = StdRng::seed_from_u64(21);

        let sample = sampler.sample(&mut rng).unwrap();
        // schemes are pinned exactly, and the operand assignment must
        // reproduce the aliasing structure of the original
        assert_eq!(sample.len(), bb.len());
        for (new, old) in sample.insns.iter().zip(bb.insns.iter()) {
            assert_eq!(new.scheme, old.scheme);
        }
        let relifted = AbstractBlock::from_concrete(&fm, &sample);
        assert_eq!(relifted, lifted, "resampling must preserve the lifted abstraction");
    }
}

#[test]
fn subsumption_soundness() {
    init();
    let fm = demo_fm();
    let bb = parse_block(fm.ctx(), "add rax, rbx\nadc rcx, rax").unwrap();
    let mut ab = AbstractBlock::from_concrete(&fm, &bb);
    for _ in 0..4 {
        let expansions = ab.possible_expansions(&fm);
        let (expansion, _) = expansions.into_iter().next().unwrap();
        ab.apply_expansion(&expansion);
    }

    // every block the point-check admits must be reachable by sampling;
    // exercised on a bounded sample set
    let sampler = Sampler::new(&fm, &ab, &HashSet::new()).unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    let mut admitted = 0;
    for _ in 0..200 {
        let sample = sampler.sample(&mut rng).unwrap();
        assert!(
            ab.contains_concrete(&fm, &sample),
            "sampling must stay within the concretization"
        );
        admitted += 1;
    }
    assert_eq!(admitted, 200);

    // and the original member is still producible from its own lift
    let lifted = AbstractBlock::from_concrete(&fm, &bb);
    assert!(ab.subsumes(&lifted));
    let sampler = Sampler::new(&fm, &lifted, &HashSet::new()).unwrap();
    let sample = sampler.sample(&mut rng).unwrap();
    assert!(ab.contains_concrete(&fm, &sample));
}

#[test]
fn sampler_determinism() {
    init();
    let fm = demo_fm();
    let top = AbstractBlock::make_top(&fm, 4);
    let sampler = Sampler::new(&fm, &top, &HashSet::new()).unwrap();

    let draw = |seed: u64| {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..30)
            .map(|_| sampler.sample(&mut rng).unwrap().asm(fm.ctx()))
            .collect::<Vec<_>>()
    };

    assert_eq!(draw(99), draw(99));
}

#[test]
fn serializer_round_trip() {
    init();
    let fm = demo_fm();
    let seeds = &[
        "add rax, rbx",
        "add qword ptr [rbp + 0x40], rax\nadd qword ptr [rbp + 0x40], rbx",
        "imul rax, rbx\nmov rcx, rax\nxor rdx, rdx",
    ];
    for asm in seeds {
        let bb = parse_block(fm.ctx(), asm).unwrap();
        let mut ab = AbstractBlock::from_concrete(&fm, &bb);
        loop {
            let json = ab.to_json(&fm);
            let text = serde_json::to_string(&json).unwrap();
            let reparsed: serde_json::Value = serde_json::from_str(&text).unwrap();
            let decoded = AbstractBlock::from_json(&fm, &reparsed).unwrap();
            assert_eq!(decoded, ab);
            assert_eq!(
                serde_json::to_string(&decoded.to_json(&fm)).unwrap(),
                text,
                "serialization must be canonical"
            );

            // walk a few steps up the lattice to cover relaxed states
            let expansions = ab.possible_expansions(&fm);
            match expansions.into_iter().nth(1).or_else(|| {
                ab.possible_expansions(&fm).into_iter().next()
            }) {
                Some((expansion, _)) => ab.apply_expansion(&expansion),
                None => break,
            }
        }
    }
}

#[test]
fn make_top_sampling_sanity() {
    init();
    let fm = demo_fm();
    let universe: HashSet<_> = fm.ctx().filtered_schemes().iter().copied().collect();
    let top = AbstractBlock::make_top(&fm, 3);
    let sampler = Sampler::new(&fm, &top, &HashSet::new()).unwrap();
    let mut rng = StdRng::seed_from_u64(1);
    for _ in 0..100 {
        let bb = sampler.sample(&mut rng).unwrap();
        assert_eq!(bb.len(), 3);
        for insn in &bb.insns {
            assert!(universe.contains(&insn.scheme));
        }
        assert!(top.contains_concrete(&fm, &bb));
    }
}
