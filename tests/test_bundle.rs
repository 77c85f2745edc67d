use std::path::PathBuf;
use storm_cells::core_modules::bundle::{FrameBundle, BUNDLE_EXTENSION};
use storm_cells::core_modules::palette::{IndexedImage, RADAR_COLOR_SCALE};
use storm_cells::{build_sequence, FrameKind, PipelineConfig, RadarFrame};

/// A 56x56 frame with two storms: a strong one (class 10) and a weak one (class 6).
fn two_storms(frame_id: &str, shift: usize) -> RadarFrame {
    let palette = vec![[0, 0, 0, 0], RADAR_COLOR_SCALE[9], RADAR_COLOR_SCALE[5]];
    let indices = (0..56 * 56)
        .map(|i| {
            let (r, c) = (i / 56, i % 56);
            if (10..22).contains(&r) && (10 + shift..22 + shift).contains(&c) {
                1
            } else if (32..44).contains(&r) && (30..42).contains(&c) {
                2
            } else {
                0
            }
        })
        .collect();
    let image = IndexedImage::new(56, 56, indices, palette).expect("Error Building Image.");
    RadarFrame::from_image(frame_id, &format!("{frame_id}.png"), image)
}

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("storm_cells_{}_{}", name, std::process::id()));
    std::fs::create_dir_all(&dir).expect("Error Creating Scratch Directory.");
    dir
}

#[test]
fn bundle_file_round_trip_is_bit_identical() {
    let config = PipelineConfig::default();
    let frame = two_storms("IDR023.T.202401010000", 0);
    let expected = frame.analyze(&config).expect("Error Analyzing Frame.");
    assert_eq!(expected.cells.cell_count(), 1);
    assert_eq!(expected.intensity.blob_count(6), 2);

    let dir = scratch_dir("round_trip");
    let path = dir.join(format!("{}.{}", frame.frame_id(), BUNDLE_EXTENSION));
    frame.to_bundle(&config).expect("Error Packing Bundle.").write_to(&path).expect("Error Writing Bundle.");

    let restored = RadarFrame::from_bundle_file(&path).expect("Error Reading Bundle.");
    assert_eq!(restored.kind(), FrameKind::Analyzed);
    assert_eq!(restored.frame_id(), "IDR023.T.202401010000");
    assert_eq!(restored.filename(), "IDR023.T.202401010000.png");
    assert_eq!(restored.analysis(), Some(expected));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn sequences_rebuild_from_bundles() {
    let config = PipelineConfig::default();
    let frames = vec![two_storms("t0", 0), two_storms("t1", 1), two_storms("t2", 2)];
    let direct = build_sequence(&frames, &config).expect("Error Building Sequence.");

    let restored: Vec<RadarFrame> = frames
        .iter()
        .map(|frame| {
            let bytes = frame
                .to_bundle(&config)
                .and_then(|bundle| Ok(bundle.to_bytes()?))
                .expect("Error Encoding Bundle.");
            let bundle = FrameBundle::from_bytes(&bytes).expect("Error Decoding Bundle.");
            RadarFrame::from_bundle(&bundle).expect("Error Restoring Frame.")
        })
        .collect();
    let rebuilt = build_sequence(&restored, &config).expect("Error Rebuilding Sequence.");

    assert_eq!(rebuilt.frame_ids(), direct.frame_ids());
    assert_eq!(rebuilt.deltas(), direct.deltas());
    assert_eq!(rebuilt.get_track("t1", 1), direct.get_track("t1", 1));
}

#[test]
fn missing_bundle_is_an_error() {
    let path = scratch_dir("missing").join("nowhere.bra");
    assert!(RadarFrame::from_bundle_file(&path).is_err());
}

#[test]
fn corrupt_bundle_is_an_error_not_a_crash() {
    let config = PipelineConfig::default();
    let bundle = two_storms("t0", 0).to_bundle(&config).expect("Error Packing Bundle.");
    let mut bytes = bundle.to_bytes().expect("Error Encoding Bundle.");
    // Chop the tail: the last compressed array no longer decodes.
    bytes.truncate(bytes.len() - 8);
    let restored = FrameBundle::from_bytes(&bytes).and_then(|bundle| bundle.unpack());
    assert!(restored.is_err());
}
