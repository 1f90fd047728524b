//! End-to-end stratagem correctness: replaying a ReverseCrc32Hunter plan
//! over a zeroed buffer must reproduce the requested payload exactly.

use depthcharge_hunter::hunter::HunterOptions;
use depthcharge_hunter::revcrc32::{ReverseCrc32Hunter, ReverseCrc32Options};
use depthcharge_hunter::stratagem::Stratagem;

fn random_data(len: usize, seed: u32) -> Vec<u8> {
    let mut state = seed.wrapping_mul(0x9e37_79b9) | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 8) as u8
        })
        .collect()
}

/// Replay the CRC32 operations a stratagem describes, exactly as the target
/// would execute them: the first iteration reads from the source (or the
/// in-progress buffer), subsequent iterations re-CRC the 4-byte output in
/// place.
fn simulate(stratagem: &Stratagem, data: &[u8], base: u64, out_len: usize) -> Vec<u8> {
    let mut out = vec![0u8; out_len];

    for entry in stratagem.entries() {
        let dst = entry.dst_off as usize;

        let first = match entry.tsrc_off {
            None => {
                let src = (entry.src_addr as u64 - base) as usize;
                crc32fast::hash(&data[src..src + entry.src_size as usize])
            }
            Some(tsrc) => {
                let tsrc = tsrc as usize;
                crc32fast::hash(&out[tsrc..tsrc + 4])
            }
        };
        out[dst..dst + 4].copy_from_slice(&first.to_le_bytes());

        for _ in 1..entry.iterations.unwrap_or(1) {
            let crc = crc32fast::hash(&out[dst..dst + 4]);
            out[dst..dst + 4].copy_from_slice(&crc.to_le_bytes());
        }
    }

    out
}

#[test]
fn test_reverse_crc32_round_trip() {
    let base = 0x8780_0000;
    let data = random_data(8192, 0);

    let mut payload = Vec::new();
    payload.extend_from_slice(b"STRT");
    for _ in 0..8 {
        payload.extend_from_slice(b"zebra");
    }
    payload.extend_from_slice(b"DONE");
    assert_eq!(payload.len(), 48);

    let hunter = ReverseCrc32Hunter::new(
        &data,
        base,
        &HunterOptions::default(),
        ReverseCrc32Options {
            revlut_maxlen: 200,
            ..ReverseCrc32Options::default()
        },
    )
    .unwrap();

    let stratagem = hunter.build_stratagem(&payload, 200_000).unwrap();
    assert_eq!(stratagem.operation_name(), "CRC32MemoryWriter");

    let produced = simulate(&stratagem, &data, base, payload.len());
    assert_eq!(produced, payload);

    // The plan also survives a JSON round trip intact
    let json = stratagem.to_json().unwrap();
    let reloaded = Stratagem::from_json(&json).unwrap();
    assert_eq!(reloaded.entries(), stratagem.entries());

    let reproduced = simulate(&reloaded, &data, base, payload.len());
    assert_eq!(reproduced, payload);
}

#[test]
fn test_round_trip_with_gaps() {
    let base = 0x8780_0000;
    let data = random_data(8192, 42);
    let payload = b"\xde\xad\xbe\xef\x00\x00\x00\x00washhere";

    let gaps = vec![depthcharge_hunter::hunter::gap(base + 0x400, 0x200)];
    let hunter = ReverseCrc32Hunter::new(
        &data,
        base,
        &HunterOptions {
            gaps,
            ..HunterOptions::default()
        },
        ReverseCrc32Options {
            revlut_maxlen: 200,
            ..ReverseCrc32Options::default()
        },
    )
    .unwrap();

    let stratagem = hunter.build_stratagem(payload, 200_000).unwrap();

    // No entry may source data from within the gap
    for entry in stratagem.entries() {
        if entry.src_addr >= 0 {
            let start = entry.src_addr as u64;
            let end = start + entry.src_size;
            assert!(end <= base + 0x400 || start >= base + 0x600);
        }
    }

    let produced = simulate(&stratagem, &data, base, payload.len());
    assert_eq!(produced, payload.to_vec());
}
