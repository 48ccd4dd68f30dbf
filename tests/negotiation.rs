//! Integration tests for codec negotiation
//!
//! Tests bitpool selection against peer ranges, packet sizing from the
//! transport MTU, and codec information exchange between source and sink.

use a2dp_media::codec::negotiator::{NegotiationError, Negotiator};
use a2dp_media::codec::sbc::{ChannelMode, SamplingFrequency};
use a2dp_media::{EncoderConfig, EngineConfig, LinkCapabilities, SbcCodecInfo};

fn hq_stereo() -> EncoderConfig {
    EncoderConfig {
        channel_mode: ChannelMode::Stereo,
        subbands: 8,
        blocks: 16,
        sampling_frequency: SamplingFrequency::Hz44100,
        ..EncoderConfig::default()
    }
}

/// Test the high quality stereo profile at 328 kbps against a [2, 53] peer
#[test]
fn test_hq_stereo_bitpool_and_packet_size() {
    let negotiator = Negotiator::default();
    let mut config = hq_stereo();

    let decision = negotiator.compute_bitpool(&config, 2, 53, 328).unwrap();
    assert!(
        (2..=53).contains(&decision.bitpool),
        "Bitpool {} outside peer range",
        decision.bitpool
    );

    config.bitpool = decision.bitpool;
    config.mtu = 663;
    let frames = negotiator.max_frames_per_packet(&config, LinkCapabilities::default());
    assert!(
        (5..=7).contains(&frames),
        "Expected 5-7 frames per 663-byte packet, got {}",
        frames
    );
}

/// Test that every accepted bitpool lies inside the peer's range
#[test]
fn test_bitpool_never_leaves_peer_range() {
    let negotiator = Negotiator::default();
    let profiles = [
        hq_stereo(),
        EncoderConfig::default(),
        EncoderConfig {
            channel_mode: ChannelMode::Mono,
            ..EncoderConfig::default()
        },
        EncoderConfig {
            sampling_frequency: SamplingFrequency::Hz48000,
            subbands: 4,
            blocks: 8,
            ..EncoderConfig::default()
        },
    ];
    let ranges = [(2u8, 53u8), (2, 32), (20, 35), (40, 64), (2, 250), (53, 53)];
    let targets = [64u16, 128, 229, 328, 512];

    for config in &profiles {
        for &(min, max) in &ranges {
            for &target in &targets {
                match negotiator.compute_bitpool(config, min, max, target) {
                    Ok(decision) => assert!(
                        (min..=max).contains(&decision.bitpool),
                        "{:?} [{}, {}] @ {} kbps gave {}",
                        config.channel_mode,
                        min,
                        max,
                        target,
                        decision.bitpool
                    ),
                    Err(e) => assert!(
                        !matches!(e, NegotiationError::InvalidRange { .. }),
                        "Valid range reported invalid: {}",
                        e
                    ),
                }
            }
        }
    }
}

/// Test that an inverted or too-small peer range is rejected
#[test]
fn test_invalid_peer_range_rejected() {
    let negotiator = Negotiator::default();
    let config = hq_stereo();
    assert!(matches!(
        negotiator.compute_bitpool(&config, 40, 20, 328),
        Err(NegotiationError::InvalidRange { min: 40, max: 20 })
    ));
    assert!(negotiator.compute_bitpool(&config, 1, 20, 328).is_err());
}

/// Test that basic-rate peers start from the lower bitrate ceiling
#[test]
fn test_initial_bitrate_by_link() {
    let config = EngineConfig::default();
    let negotiator = Negotiator::from_config(&config);
    let edr = LinkCapabilities {
        edr: true,
        edr_3mbps: true,
    };
    assert_eq!(negotiator.initial_bitrate(edr), config.default_bitrate_kbps);
    assert_eq!(
        negotiator.initial_bitrate(LinkCapabilities::default()),
        config.non_edr_max_bitrate_kbps
    );
}

/// Test that 2 Mbps EDR peers get a capped MTU
#[test]
fn test_mtu_capped_for_2mbps_peers() {
    let config = EngineConfig::default();
    let negotiator = Negotiator::from_config(&config);
    let edr_2m = LinkCapabilities {
        edr: true,
        edr_3mbps: false,
    };
    let edr_3m = LinkCapabilities {
        edr: true,
        edr_3mbps: true,
    };
    assert_eq!(negotiator.effective_mtu(895, edr_2m), config.max_2mbps_mtu);
    assert_eq!(negotiator.effective_mtu(895, edr_3m), 895);
}

/// Test that a sink configured from the source's choice agrees on the format
#[test]
fn test_codec_info_exchange() {
    let local = SbcCodecInfo::default();
    let peer = SbcCodecInfo::parse_element(&local.to_element()).unwrap();
    let common = local.intersect(&peer).unwrap();
    let chosen = common.select_configuration().unwrap();

    let block = SbcCodecInfo::from_config(&chosen).to_bytes();
    let reparsed = SbcCodecInfo::parse(&block).unwrap();
    let sink_view = reparsed.select_configuration().unwrap();
    assert_eq!(sink_view.sampling_frequency, chosen.sampling_frequency);
    assert_eq!(sink_view.channel_mode, chosen.channel_mode);
    assert_eq!(sink_view.blocks, chosen.blocks);
    assert_eq!(sink_view.subbands, chosen.subbands);
}
