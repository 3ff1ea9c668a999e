//! Portal code tables (code, label).

pub const REGION_CODES: &[(&str, &str)] = &[
    ("6110000", "서울특별시"),
    ("6260000", "부산광역시"),
    ("6270000", "대구광역시"),
    ("6280000", "인천광역시"),
    ("6290000", "광주광역시"),
    ("6300000", "대전광역시"),
    ("6310000", "울산광역시"),
    ("5690000", "세종특별자치시"),
    ("6410000", "경기도"),
    ("6420000", "강원특별자치도"),
    ("6430000", "충청북도"),
    ("6440000", "충청남도"),
    ("6450000", "전북특별자치도"),
    ("6460000", "전라남도"),
    ("6470000", "경상북도"),
    ("6480000", "경상남도"),
    ("6500000", "제주특별자치도"),
];

pub const CATEGORY_CODES: &[(&str, &str)] = &[
    ("0100", "생활편의"),
    ("0200", "주거환경"),
    ("0300", "상담·멘토링"),
    ("0400", "교육"),
    ("0500", "보건·의료"),
    ("0700", "문화·체육·예술·관광"),
    ("0800", "환경·생태계보호"),
    ("0900", "사무행정"),
    ("1000", "지역안전·보호"),
    ("1100", "인권·공익"),
    ("1200", "재난·재해"),
    ("1300", "국제협력·해외봉사"),
    ("1500", "기타"),
    ("1700", "자원봉사 기본교육"),
];

pub const ACTIVITY_TYPE_CODES: &[(&str, &str)] = &[
    ("1", ONLINE),
    ("2", OFFLINE),
    ("3", ONLINE_OFFLINE),
];

pub const TARGET_CODES: &[(&str, &str)] = &[
    ("1", "아동·청소년"),
    ("2", "장애인"),
    ("3", "노인"),
    ("4", "쪽방촌"),
    ("5", "다문화가정"),
    ("6", "여성"),
    ("7", "환경"),
    ("8", "사회적기업"),
    ("9", "고향봉사"),
    ("99", "기타"),
];

pub const STATUS_CODES: &[(&str, &str)] = &[("0", "모집중"), ("1", "모집완료"), ("3", "전체")];

pub const ONLINE: &str = "온라인";
pub const OFFLINE: &str = "오프라인";
pub const ONLINE_OFFLINE: &str = "온라인+오프라인";
pub const TIME_CERTIFIED: &str = "시간인증";
