//! Scan graphs and running statistics

use interface::{units::make_phase_near, DataAdaptor, XmlError};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

/// Average and statistical error of the average
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AvgErr {
    pub avg: f64,
    pub err: f64,
}
impl AvgErr {
    /// Mean and standard error `s/√n`, the error is 0 for a single sample
    pub fn from_samples(values: &[f64]) -> Option<Self> {
        match values.len() {
            0 => None,
            1 => Some(Self {
                avg: values[0],
                err: 0.,
            }),
            n => Some(Self {
                avg: values.mean(),
                err: values.std_dev() / (n as f64).sqrt(),
            }),
        }
    }
    /// Same as [AvgErr::from_samples] for phases: the samples are made near the first one
    pub fn from_phases(phases: &[f64]) -> Option<Self> {
        let first = *phases.first()?;
        let near: Vec<f64> = phases.iter().map(|&p| make_phase_near(p, first)).collect();
        Self::from_samples(&near)
    }
    pub fn write_xml(&self, parent: &mut DataAdaptor, name: &str) {
        parent
            .create_child(name)
            .set_value("avg", self.avg)
            .set_value("err", self.err);
    }
    pub fn read_xml(parent: &DataAdaptor, name: &str) -> Result<Option<Self>, XmlError> {
        parent
            .child(name)
            .map(|da| {
                Ok(Self {
                    avg: da.f64_value("avg")?,
                    err: da.f64_value("err")?,
                })
            })
            .transpose()
    }
}

/// Sequence of `(x, y, y_err)` points
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphData {
    x: Vec<f64>,
    y: Vec<f64>,
    err: Vec<f64>,
}

impl GraphData {
    pub fn new() -> Self {
        Default::default()
    }
    pub fn add_point(&mut self, x: f64, y: f64, err: f64) -> &mut Self {
        self.x.push(x);
        self.y.push(y);
        self.err.push(err);
        self
    }
    pub fn len(&self) -> usize {
        self.x.len()
    }
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
    pub fn x(&self, i: usize) -> f64 {
        self.x[i]
    }
    pub fn y(&self, i: usize) -> f64 {
        self.y[i]
    }
    pub fn err(&self, i: usize) -> f64 {
        self.err[i]
    }
    pub fn xs(&self) -> &[f64] {
        &self.x
    }
    pub fn ys(&self) -> &[f64] {
        &self.y
    }
    pub fn errs(&self) -> &[f64] {
        &self.err
    }
    /// Iterator over the `(x, y, err)` points
    pub fn points(&self) -> impl Iterator<Item = (f64, f64, f64)> + '_ {
        self.x
            .iter()
            .zip(&self.y)
            .zip(&self.err)
            .map(|((&x, &y), &e)| (x, y, e))
    }
    pub fn remove_last_point(&mut self) -> Option<(f64, f64, f64)> {
        let x = self.x.pop()?;
        let y = self.y.pop()?;
        let e = self.err.pop()?;
        Some((x, y, e))
    }
    pub fn remove_point(&mut self, i: usize) -> (f64, f64, f64) {
        (self.x.remove(i), self.y.remove(i), self.err.remove(i))
    }
    pub fn clear(&mut self) {
        self.x.clear();
        self.y.clear();
        self.err.clear();
    }
    pub fn min_y(&self) -> Option<f64> {
        self.y.iter().cloned().reduce(f64::min)
    }
    pub fn max_y(&self) -> Option<f64> {
        self.y.iter().cloned().reduce(f64::max)
    }
    /// Linear interpolation of y at `x`
    ///
    /// The points are assumed sorted by x; outside of the x range the first
    /// or the last segment is extrapolated.
    pub fn value_y(&self, x: f64) -> Option<f64> {
        match self.len() {
            0 => None,
            1 => Some(self.y[0]),
            n => {
                let i = self.x[1..n - 1].partition_point(|&xi| xi < x);
                let (x0, x1, y0, y1) = (self.x[i], self.x[i + 1], self.y[i], self.y[i + 1]);
                if x1 == x0 {
                    Some(y0)
                } else {
                    Some(y0 + (y1 - y0) * (x - x0) / (x1 - x0))
                }
            }
        }
    }
    /// Shifts the whole graph by a multiple of 360° so the first point is near `phase`
    /// and makes every following point near its predecessor
    pub fn unwrap_phases_near(&mut self, phase: f64) {
        let mut reference = phase;
        for y in self.y.iter_mut() {
            *y = make_phase_near(*y, reference);
            reference = *y;
        }
    }

    pub fn write_xml(&self, parent: &mut DataAdaptor, name: &str) {
        let da = parent.create_child(name);
        let points: Vec<f64> = self.points().flat_map(|(x, y, e)| [x, y, e]).collect();
        da.set_value("n", self.len());
        da.set_f64_array("points", &points);
    }
    /// Reads the graph from the child `name` of `parent`, an absent child is an empty graph
    pub fn read_xml(parent: &DataAdaptor, name: &str) -> Result<Self, XmlError> {
        let mut gd = Self::new();
        if let Some(da) = parent.child(name) {
            let points = da.f64_array("points")?;
            if points.len() % 3 != 0 {
                return Err(XmlError::InvalidValue {
                    element: name.to_string(),
                    attribute: "points".into(),
                    value: format!("{} values", points.len()),
                });
            }
            for p in points.chunks(3) {
                gd.add_point(p[0], p[1], p[2]);
            }
        }
        Ok(gd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avg_err() {
        let s = AvgErr::from_samples(&[1., 2., 3., 4.]).unwrap();
        assert!((s.avg - 2.5).abs() < 1e-12);
        assert!((s.err - (5f64 / 3.).sqrt() / 2.).abs() < 1e-12);
        assert_eq!(AvgErr::from_samples(&[7.]).unwrap().err, 0.);
        assert!(AvgErr::from_samples(&[]).is_none());
        let p = AvgErr::from_phases(&[179., -179.]).unwrap();
        assert!((p.avg - 180.).abs() < 1e-12);
    }

    #[test]
    fn interpolation() {
        let mut gd = GraphData::new();
        gd.add_point(0., 0., 0.).add_point(1., 2., 0.).add_point(3., 4., 0.);
        assert_eq!(gd.value_y(0.5), Some(1.));
        assert_eq!(gd.value_y(2.), Some(3.));
        assert_eq!(gd.value_y(-1.), Some(-2.));
        assert_eq!(gd.value_y(4.), Some(5.));
        assert_eq!(gd.remove_last_point(), Some((3., 4., 0.)));
        assert_eq!(gd.len(), 2);
    }

    #[test]
    fn xml() {
        let mut gd = GraphData::new();
        gd.add_point(-180., 0.1, 0.01).add_point(-170., 1. / 3., 0.);
        let mut root = DataAdaptor::new("ROOT");
        gd.write_xml(&mut root, "phase_gd");
        let back = GraphData::read_xml(&root, "phase_gd").unwrap();
        assert_eq!(back, gd);
        assert!(GraphData::read_xml(&root, "amp_gd").unwrap().is_empty());
    }
}
