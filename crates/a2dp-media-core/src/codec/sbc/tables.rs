//! Constant tables for the SBC filterbank and bit allocation.

/// Prototype filter coefficients for 4 subbands (40 taps).
pub(crate) const PROTO_4: [f32; 40] = [
    0.000_000_00e+00, 5.365_489_76e-04, 1.491_883_57e-03, 2.733_709_04e-03,
    3.837_201_93e-03, 3.892_051_49e-03, 1.865_816_91e-03, -3.060_122_86e-03,
    1.091_376_20e-02, 2.043_850_87e-02, 2.887_573_92e-02, 3.219_392_90e-02,
    2.587_678_11e-02, 6.132_451_86e-03, -2.882_172_74e-02, -7.764_634_94e-02,
    1.355_932_74e-01, 1.949_878_41e-01, 2.466_366_62e-01, 2.818_282_03e-01,
    2.943_153_32e-01, 2.818_282_03e-01, 2.466_366_62e-01, 1.949_878_41e-01,
    -1.355_932_74e-01, -7.764_634_94e-02, -2.882_172_74e-02, 6.132_451_86e-03,
    2.587_678_11e-02, 3.219_392_90e-02, 2.887_573_92e-02, 2.043_850_87e-02,
    -1.091_376_20e-02, -3.060_122_86e-03, 1.865_816_91e-03, 3.892_051_49e-03,
    3.837_201_93e-03, 2.733_709_04e-03, 1.491_883_57e-03, 5.365_489_76e-04,
];

/// Prototype filter coefficients for 8 subbands (80 taps).
pub(crate) const PROTO_8: [f32; 80] = [
    0.000_000_00e+00, 1.565_753_98e-04, 3.432_564_25e-04, 5.546_202_02e-04,
    8.239_195_06e-04, 1.139_925_07e-03, 1.476_401_69e-03, 1.783_717_25e-03,
    2.011_825_42e-03, 2.103_719_89e-03, 1.994_545_54e-03, 1.616_562_83e-03,
    9.021_545_02e-04, -1.788_053_61e-04, -1.649_730_98e-03, -3.497_174_54e-03,
    5.659_494_73e-03, 8.029_411_63e-03, 1.045_844_43e-02, 1.274_723_35e-02,
    1.465_252_63e-02, 1.590_456_03e-02, 1.622_084_71e-02, 1.531_841_06e-02,
    1.293_718_06e-02, 8.857_575_40e-03, 2.924_084_42e-03, -4.915_780_24e-03,
    -1.464_040_76e-02, -2.610_987_52e-02, -3.907_513_81e-02, -5.318_730_32e-02,
    6.799_894_31e-02, 8.298_475_78e-02, 9.757_539_18e-02, 1.111_966_89e-01,
    1.232_645_48e-01, 1.332_644_15e-01, 1.407_535_05e-01, 1.453_898_47e-01,
    1.469_550_68e-01, 1.453_898_47e-01, 1.407_535_05e-01, 1.332_644_15e-01,
    1.232_645_48e-01, 1.111_966_89e-01, 9.757_539_18e-02, 8.298_475_78e-02,
    -6.799_894_31e-02, -5.318_730_32e-02, -3.907_513_81e-02, -2.610_987_52e-02,
    -1.464_040_76e-02, -4.915_780_24e-03, 2.924_084_42e-03, 8.857_575_40e-03,
    1.293_718_06e-02, 1.531_841_06e-02, 1.622_084_71e-02, 1.590_456_03e-02,
    1.465_252_63e-02, 1.274_723_35e-02, 1.045_844_43e-02, 8.029_411_63e-03,
    -5.659_494_73e-03, -3.497_174_54e-03, -1.649_730_98e-03, -1.788_053_61e-04,
    9.021_545_02e-04, 1.616_562_83e-03, 1.994_545_54e-03, 2.103_719_89e-03,
    2.011_825_42e-03, 1.783_717_25e-03, 1.476_401_69e-03, 1.139_925_07e-03,
    8.239_195_06e-04, 5.546_202_02e-04, 3.432_564_25e-04, 1.565_753_98e-04,
];

/// Loudness offsets for 4 subbands, indexed by sampling frequency (16k, 32k, 44.1k, 48k).
pub(crate) const LOUDNESS_OFFSET_4: [[i32; 4]; 4] = [
    [-1, 0, 0, 0],
    [-2, 0, 0, 1],
    [-2, 0, 0, 1],
    [-2, 0, 0, 1],
];

/// Loudness offsets for 8 subbands, indexed by sampling frequency (16k, 32k, 44.1k, 48k).
pub(crate) const LOUDNESS_OFFSET_8: [[i32; 8]; 4] = [
    [-2, 0, 0, 0, 0, 0, 0, 1],
    [-3, 0, 0, 0, 0, 0, 1, 2],
    [-4, 0, 0, 0, 0, 0, 1, 2],
    [-4, 0, 0, 0, 0, 0, 1, 2],
];

/// Returns the prototype window for the given subband count.
pub(crate) fn proto(subbands: usize) -> &'static [f32] {
    if subbands == 4 {
        &PROTO_4
    } else {
        &PROTO_8
    }
}
