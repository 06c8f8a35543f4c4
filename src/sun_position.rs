use crate::types::SolarPosition;
use chrono::{DateTime, TimeZone, Utc};
use std::f64::consts::PI;

const DAY_SECONDS: f64 = 86_400.0;
const J1970: f64 = 2_440_588.0;
const J2000: f64 = 2_451_545.0;
const J0: f64 = 0.0009;

/// Obliquity of the ecliptic (radians).
const OBLIQUITY: f64 = 23.4397 * PI / 180.0;
/// Altitude of the sun's upper limb at rise/set, refraction included (degrees).
const SUNRISE_ALTITUDE_DEG: f64 = -0.833;

/// Sun altitude/azimuth for one instant and place.
///
/// Low-precision ephemeris: mean anomaly, equation of centre, ecliptic
/// longitude, equatorial coordinates and local sidereal time. Pure function of
/// its arguments.
pub fn compute_sun(instant: &DateTime<Utc>, latitude: f64, longitude: f64) -> SolarPosition {
    SunCalculator::new(latitude, longitude).get_position(instant)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SunTimes {
    pub solar_noon: DateTime<Utc>,
    /// `None` on days the sun does not cross the horizon.
    pub sunrise: Option<DateTime<Utc>>,
    pub sunset: Option<DateTime<Utc>>,
}

impl SunTimes {
    pub fn daylight_hours(&self) -> Option<f64> {
        match (self.sunrise, self.sunset) {
            (Some(rise), Some(set)) => Some((set - rise).num_seconds() as f64 / 3600.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SunCalculator {
    latitude: f64,
    longitude: f64,
}

impl SunCalculator {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    pub fn get_position(&self, datetime: &DateTime<Utc>) -> SolarPosition {
        let (azimuth, altitude) = self.calculate_position(datetime);
        SolarPosition::from_altitude_azimuth(altitude, azimuth)
    }

    /// Returns `(azimuth, altitude)` in radians, azimuth measured from south.
    fn calculate_position(&self, datetime: &DateTime<Utc>) -> (f64, f64) {
        let lw = (-self.longitude).to_radians();
        let phi = self.latitude.to_radians();
        let d = days_since_j2000(datetime);

        let m = solar_mean_anomaly(d);
        let l = ecliptic_longitude(m);
        let dec = declination(l);
        let ra = right_ascension(l);

        let hour_angle = sidereal_time(d, lw) - ra;

        let azimuth = hour_angle
            .sin()
            .atan2(hour_angle.cos() * phi.sin() - dec.tan() * phi.cos());
        let altitude =
            (phi.sin() * dec.sin() + phi.cos() * dec.cos() * hour_angle.cos()).asin();

        (azimuth, altitude)
    }

    pub fn sun_times(&self, datetime: &DateTime<Utc>) -> Option<SunTimes> {
        let lw = (-self.longitude).to_radians();
        let phi = self.latitude.to_radians();
        let d = days_since_j2000(datetime);

        let n = julian_cycle(d, lw);
        let ds = approx_transit(0.0, lw, n);
        let m = solar_mean_anomaly(ds);
        let l = ecliptic_longitude(m);
        let dec = declination(l);

        let j_noon = solar_transit_j(ds, m, l);
        let solar_noon = from_julian(j_noon)?;

        let w = hour_angle(SUNRISE_ALTITUDE_DEG.to_radians(), phi, dec);
        let (sunrise, sunset) = if w.is_nan() {
            (None, None)
        } else {
            let j_set = solar_transit_j(approx_transit(w, lw, n), m, l);
            let j_rise = j_noon - (j_set - j_noon);
            (from_julian(j_rise), from_julian(j_set))
        };

        Some(SunTimes {
            solar_noon,
            sunrise,
            sunset,
        })
    }

    pub fn calculate_sunrise_sunset(
        &self,
        datetime: &DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let times = self.sun_times(datetime)?;
        Some((times.sunrise?, times.sunset?))
    }

    pub fn calculate_solar_noon(&self, datetime: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.sun_times(datetime).map(|t| t.solar_noon)
    }
}

fn days_since_j2000(datetime: &DateTime<Utc>) -> f64 {
    let seconds =
        datetime.timestamp() as f64 + datetime.timestamp_subsec_nanos() as f64 * 1e-9;
    seconds / DAY_SECONDS - 0.5 + J1970 - J2000
}

fn from_julian(j: f64) -> Option<DateTime<Utc>> {
    let millis = (j + 0.5 - J1970) * DAY_SECONDS * 1000.0;
    if !millis.is_finite() {
        return None;
    }
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

fn solar_mean_anomaly(d: f64) -> f64 {
    (357.5291 + 0.985_600_28 * d).to_radians()
}

fn ecliptic_longitude(m: f64) -> f64 {
    let center = (1.9148 * m.sin() + 0.02 * (2.0 * m).sin() + 0.0003 * (3.0 * m).sin()).to_radians();
    let perihelion = 102.9372_f64.to_radians();
    m + center + perihelion + PI
}

fn declination(l: f64) -> f64 {
    (OBLIQUITY.sin() * l.sin()).asin()
}

fn right_ascension(l: f64) -> f64 {
    (l.sin() * OBLIQUITY.cos()).atan2(l.cos())
}

fn sidereal_time(d: f64, lw: f64) -> f64 {
    (280.16 + 360.985_623_5 * d).to_radians() - lw
}

fn julian_cycle(d: f64, lw: f64) -> f64 {
    (d - J0 - lw / (2.0 * PI)).round()
}

fn approx_transit(ht: f64, lw: f64, n: f64) -> f64 {
    J0 + (ht + lw) / (2.0 * PI) + n
}

fn solar_transit_j(ds: f64, m: f64, l: f64) -> f64 {
    J2000 + ds + 0.0053 * m.sin() - 0.0069 * (2.0 * l).sin()
}

/// NaN when the sun never reaches altitude `h` that day.
fn hour_angle(h: f64, phi: f64, dec: f64) -> f64 {
    ((h.sin() - phi.sin() * dec.sin()) / (phi.cos() * dec.cos())).acos()
}
