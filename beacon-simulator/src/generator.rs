use rand::Rng;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct Datapoint {
    #[serde(rename = "S")]
    pub s: u32,
    pub e: u32,
    pub f: u32,
    pub o: u32,
    pub a: u32,
    pub r: u32,
    pub p: u32,
}

#[derive(Debug, Serialize)]
pub struct BeaconRecord {
    pub m: u32,
    pub t: u32,
    pub d: Vec<Datapoint>,
}

/// One synthetic batch: 1 to 29 records, each with 1 to 29 datapoints.
pub fn generate_batch<R: Rng + ?Sized>(rng: &mut R) -> Vec<BeaconRecord> {
    let records = rng.gen_range(1..30);
    (0..records).map(|_| generate_record(rng)).collect()
}

fn generate_record<R: Rng + ?Sized>(rng: &mut R) -> BeaconRecord {
    let datapoints = rng.gen_range(1..30);
    BeaconRecord {
        m: rng.gen_range(0..1_000_000),
        t: rng.gen_range(1..1000),
        d: (0..datapoints)
            .map(|_| Datapoint {
                s: rng.gen_range(0..250),
                e: rng.gen_range(0..50),
                f: rng.gen_range(0..20),
                o: rng.gen_range(0..24450),
                a: rng.gen_range(0..2502),
                r: rng.gen_range(0..20),
                p: rng.gen_range(0..2_000_000),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::Value;

    use super::*;

    #[test]
    fn batches_stay_within_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let batch = generate_batch(&mut rng);
            assert!((1..30).contains(&batch.len()));
            for record in &batch {
                assert!(record.m < 1_000_000);
                assert!((1..1000).contains(&record.t));
                assert!((1..30).contains(&record.d.len()));
                for point in &record.d {
                    assert!(point.s < 250);
                    assert!(point.e < 50);
                    assert!(point.f < 20);
                    assert!(point.o < 24450);
                    assert!(point.a < 2502);
                    assert!(point.r < 20);
                    assert!(point.p < 2_000_000);
                }
            }
        }
    }

    #[test]
    fn serializes_as_array_of_beacon_records() {
        let mut rng = StdRng::seed_from_u64(1);
        let payload = serde_json::to_string(&generate_batch(&mut rng)).unwrap();
        let value: Value = serde_json::from_str(&payload).unwrap();

        let records = value.as_array().expect("top level is an array");
        let first = records[0].as_object().unwrap();
        let mut keys: Vec<&str> = first.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["d", "m", "t"]);

        let point = first["d"][0].as_object().unwrap();
        let mut keys: Vec<&str> = point.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["S", "a", "e", "f", "o", "p", "r"]);
    }
}
