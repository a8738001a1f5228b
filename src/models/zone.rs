use crate::models::common::Rgb;
use crate::scenario::ZoneConfig;

/// 速度制限ゾーン
///
/// 軸に平行な矩形で表される静的なジオフェンスです。境界は4辺とも含みます。
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    /// ゾーンの一意識別子
    pub id: String,
    /// 表示名
    pub name: String,
    /// 制限速度 (km/h)
    pub speed_limit: f64,
    /// 表示色（制御ロジックでは使わない）
    pub color: Rgb,
    /// X方向の範囲 [min, max]
    pub x_range: (f64, f64),
    /// Y方向の範囲 [min, max]
    pub y_range: (f64, f64),
}

impl Zone {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        speed_limit: f64,
        color: Rgb,
        x_range: (f64, f64),
        y_range: (f64, f64),
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            speed_limit,
            color,
            x_range,
            y_range,
        }
    }

    /// 点がゾーン内にあるか
    pub fn contains_point(&self, x: f64, y: f64) -> bool {
        let (x_min, x_max) = self.x_range;
        let (y_min, y_max) = self.y_range;
        x_min <= x && x <= x_max && y_min <= y && y <= y_max
    }

    /// 最も近い境界辺までの距離（表示用）
    ///
    /// ゾーン外の点では無限大を返します。
    pub fn boundary_distance(&self, x: f64, y: f64) -> f64 {
        if !self.contains_point(x, y) {
            return f64::INFINITY;
        }
        let (x_min, x_max) = self.x_range;
        let (y_min, y_max) = self.y_range;
        (x - x_min)
            .abs()
            .min((x - x_max).abs())
            .min((y - y_min).abs())
            .min((y - y_max).abs())
    }
}

impl From<&ZoneConfig> for Zone {
    fn from(config: &ZoneConfig) -> Self {
        Zone::new(
            config.id.clone(),
            config.name.clone(),
            config.speed_limit_kmh,
            config.color,
            (config.x_range_m[0], config.x_range_m[1]),
            (config.y_range_m[0], config.y_range_m[1]),
        )
    }
}

/// 位置からゾーンを決定するリゾルバー
///
/// 設定順に走査して最初に含むゾーンを返します。どのゾーンにも含まれない場合は
/// 直前に一致したゾーンを返し（スティッキーフォールバック）、まだ一度も一致して
/// いなければ先頭のゾーンを返します。
#[derive(Debug, Clone)]
pub struct ZoneResolver {
    zones: Vec<Zone>,
    /// 最後に一致したゾーンの添字（未一致なら None）
    last_resolved_zone: Option<usize>,
    /// ゾーンが決まらないときの制限速度 (km/h)
    fallback_limit: f64,
}

impl ZoneResolver {
    /// # 引数
    ///
    /// * `zones` - 走査順に並んだゾーン
    /// * `fallback_limit` - 一度もゾーンに一致していないときの制限速度（車両の最高速度）
    pub fn new(zones: Vec<Zone>, fallback_limit: f64) -> Self {
        Self {
            zones,
            last_resolved_zone: None,
            fallback_limit,
        }
    }

    pub fn from_config(zones: &[ZoneConfig], fallback_limit: f64) -> Self {
        Self::new(zones.iter().map(Zone::from).collect(), fallback_limit)
    }

    fn find(&self, x: f64, y: f64) -> Option<usize> {
        self.zones.iter().position(|zone| zone.contains_point(x, y))
    }

    /// 位置に対応するゾーンを返す
    ///
    /// ゾーンが1つも設定されていない場合のみ None になります。
    pub fn resolve(&mut self, x: f64, y: f64) -> Option<&Zone> {
        if let Some(index) = self.find(x, y) {
            self.last_resolved_zone = Some(index);
        }
        let index = self.last_resolved_zone.unwrap_or(0);
        self.zones.get(index)
    }

    /// 位置の制限速度 (km/h)
    ///
    /// 一度もゾーンに一致していない場合は車両の最高速度を返します。
    pub fn speed_limit_at(&mut self, x: f64, y: f64) -> f64 {
        let zone = self.resolve(x, y).map(|zone| zone.speed_limit);
        match (self.last_resolved_zone, zone) {
            (Some(_), Some(limit)) => limit,
            _ => self.fallback_limit,
        }
    }

    /// 直前に一致したゾーン
    pub fn last_resolved(&self) -> Option<&Zone> {
        self.last_resolved_zone.and_then(|index| self.zones.get(index))
    }

    /// 直前に一致したゾーンの境界までの距離（未一致なら無限大）
    pub fn boundary_distance(&self, x: f64, y: f64) -> f64 {
        self.last_resolved()
            .map(|zone| zone.boundary_distance(x, y))
            .unwrap_or(f64::INFINITY)
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn fallback_limit(&self) -> f64 {
        self.fallback_limit
    }
}
